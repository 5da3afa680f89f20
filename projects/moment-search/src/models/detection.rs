use super::{BBox, Detection, Detector};
use crate::config::ModelConfig;
use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, GenericImageView};
use usls::models::RTDETR;
use usls::{Config, Image};

/// RT-DETR detector from usls with COCO-80 class names.
///
/// usls pads non-square inputs and reports boxes in the padded square's
/// coordinates; boxes are scaled back along the longer axis here.
pub struct RtDetrDetector {
    model_path: String,
    accelerate: bool,
    model: Option<RTDETR>,
}

impl RtDetrDetector {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            model_path: config.detector_model.clone(),
            accelerate: config.accelerate,
            model: None,
        }
    }
}

// SAFETY: the model is owned by one engine and only used through `&mut self`,
// so it is never accessed from two threads at once.
unsafe impl Send for RtDetrDetector {}

/// Scale factors undoing the square padding for a `w x h` image.
fn padding_correction(w: f32, h: f32) -> (f32, f32) {
    if w > h {
        (w / h, 1.0)
    } else if h > w {
        (1.0, h / w)
    } else {
        (1.0, 1.0)
    }
}

impl Detector for RtDetrDetector {
    fn ensure_loaded(&mut self) -> Result<()> {
        if self.model.is_some() {
            return Ok(());
        }
        tracing::info!("Loading detector model from {}", self.model_path);

        let config = Config::default()
            .with_model_file(&self.model_path)
            .with_class_names(&usls::NAMES_COCO_80);

        #[cfg(target_os = "macos")]
        let config = if self.accelerate {
            config.with_model_device(usls::Device::CoreMl)
        } else {
            config
        };
        if cfg!(not(target_os = "macos")) && self.accelerate {
            tracing::debug!("No accelerated detector device on this platform, using CPU");
        }

        let config = config
            .commit()
            .with_context(|| format!("Invalid detector configuration for {}", self.model_path))?;
        let model = RTDETR::new(config).context("Failed to load detector model")?;
        self.model = Some(model);
        Ok(())
    }

    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<Detection>> {
        self.ensure_loaded()?;
        let model = self
            .model
            .as_mut()
            .ok_or_else(|| anyhow!("Detector model not loaded"))?;

        let (w, h) = image.dimensions();
        let (x_corr, y_corr) = padding_correction(w as f32, h as f32);

        let results = model.forward(&[Image::from(image.clone())])?;
        let detections = results
            .into_iter()
            .next()
            .map(|y| y.hbbs)
            .unwrap_or_default()
            .into_iter()
            .map(|hbb| Detection {
                label: hbb.name().unwrap_or_default().to_string(),
                confidence: hbb.confidence().unwrap_or(0.0),
                bbox: BBox {
                    x: hbb.xmin() * x_corr,
                    y: hbb.ymin() * y_corr,
                    w: hbb.width() * x_corr,
                    h: hbb.height() * y_corr,
                },
            })
            .collect();

        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_correction() {
        assert_eq!(padding_correction(1920.0, 1080.0), (1920.0 / 1080.0, 1.0));
        assert_eq!(padding_correction(480.0, 640.0), (1.0, 640.0 / 480.0));
        assert_eq!(padding_correction(640.0, 640.0), (1.0, 1.0));
    }

    #[test]
    fn test_construction_does_not_load() {
        let detector = RtDetrDetector::new(&ModelConfig::default());
        assert!(detector.model.is_none());
    }
}
