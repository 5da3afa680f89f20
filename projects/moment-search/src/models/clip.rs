use super::{l2_normalize, Embedder};
use crate::config::ModelConfig;
use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use usls::models::Clip;
use usls::{Config, Image};

/// CLIP image/text encoder from usls. Weights are fetched and loaded on first use.
pub struct ClipEmbedder {
    variant: String,
    model: Option<Clip>,
}

impl ClipEmbedder {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            variant: config.clip_variant.clone(),
            model: None,
        }
    }

    fn model(&mut self) -> Result<&mut Clip> {
        self.ensure_loaded()?;
        self.model
            .as_mut()
            .ok_or_else(|| anyhow!("CLIP model not loaded"))
    }
}

// SAFETY: the model is owned by one engine and only used through `&mut self`,
// so it is never accessed from two threads at once.
unsafe impl Send for ClipEmbedder {}

fn variant_config(variant: &str) -> Config {
    match variant {
        "clip-vit-b16" => Config::clip_vit_b16(),
        "clip-vit-l14" => Config::clip_vit_l14(),
        "clip-vit-b32" => Config::clip_vit_b32(),
        other => {
            tracing::warn!("Unknown CLIP variant '{}', using clip-vit-b32", other);
            Config::clip_vit_b32()
        }
    }
}

/// Flattens a `[1, D]` feature tensor into a unit vector.
fn to_unit_vector(features: &usls::X) -> Vec<f32> {
    l2_normalize(features.iter().copied().collect())
}

impl Embedder for ClipEmbedder {
    fn ensure_loaded(&mut self) -> Result<()> {
        if self.model.is_some() {
            return Ok(());
        }
        tracing::info!("Loading CLIP model ({})", self.variant);
        let start = std::time::Instant::now();
        let config = variant_config(&self.variant)
            .commit()
            .with_context(|| format!("Invalid CLIP configuration for {}", self.variant))?;
        let model = Clip::new(config).context("Failed to load CLIP model")?;
        tracing::info!("CLIP model loaded in {:.2?}", start.elapsed());
        self.model = Some(model);
        Ok(())
    }

    fn embed_image(&mut self, image: &DynamicImage) -> Result<Vec<f32>> {
        let model = self.model()?;
        let features = model.encode_images(&[Image::from(image.clone())])?;
        Ok(to_unit_vector(&features))
    }

    fn embed_text(&mut self, text: &str) -> Result<Vec<f32>> {
        let model = self.model()?;
        let features = model.encode_texts(&[text])?;
        Ok(to_unit_vector(&features))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_does_not_load() {
        let embedder = ClipEmbedder::new(&ModelConfig::default());
        assert!(embedder.model.is_none());
        assert_eq!(embedder.variant, "clip-vit-b32");
    }
}
