use super::types::{QueryInput, QueryRepresentation};
use crate::error::SearchError;
use crate::models::{l2_normalize, mean_direction, Embedder};
use std::path::PathBuf;

/// Turns user input into the immutable query the engine compares frames against.
pub struct QueryEncoder<'a> {
    embedder: &'a mut dyn Embedder,
}

impl<'a> QueryEncoder<'a> {
    pub fn new(embedder: &'a mut dyn Embedder) -> Self {
        Self { embedder }
    }

    pub fn encode(&mut self, input: &QueryInput) -> Result<QueryRepresentation, SearchError> {
        match input {
            QueryInput::Image(paths) => self.encode_images(paths),
            QueryInput::Text(text) => self.encode_text(text),
            QueryInput::Category(name) => encode_category(name),
        }
    }

    fn encode_images(&mut self, paths: &[PathBuf]) -> Result<QueryRepresentation, SearchError> {
        // Decode first so an all-unreadable query never loads the model
        let images: Vec<(&PathBuf, image::DynamicImage)> = paths
            .iter()
            .filter_map(|path| match image::open(path) {
                Ok(img) => Some((path, img)),
                Err(e) => {
                    tracing::warn!("Skipping query image {:?}: {}", path, e);
                    None
                }
            })
            .collect();

        if images.is_empty() {
            return Err(SearchError::EmptyQuery(format!(
                "none of the {} query images could be decoded",
                paths.len()
            )));
        }

        self.embedder
            .ensure_loaded()
            .map_err(|e| SearchError::model_unavailable("embedding", e))?;

        let mut embeddings = Vec::with_capacity(images.len());
        for (path, img) in &images {
            match self.embedder.embed_image(img) {
                Ok(v) => embeddings.push(v),
                Err(e) => tracing::warn!("Skipping query image {:?}: {:#}", path, e),
            }
        }
        if embeddings.is_empty() {
            return Err(SearchError::EmptyQuery(
                "no query image could be embedded".to_string(),
            ));
        }

        let query = mean_direction(&embeddings)
            .map_err(|e| SearchError::EmptyQuery(format!("{:#}", e)))?;
        tracing::info!(
            "Image query built from {}/{} examples ({} dims)",
            embeddings.len(),
            paths.len(),
            query.len()
        );
        Ok(QueryRepresentation::Embedding(query))
    }

    fn encode_text(&mut self, text: &str) -> Result<QueryRepresentation, SearchError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SearchError::EmptyQuery("text query is empty".to_string()));
        }

        self.embedder
            .ensure_loaded()
            .map_err(|e| SearchError::model_unavailable("embedding", e))?;

        let vector = self
            .embedder
            .embed_text(text)
            .map_err(|e| SearchError::EmptyQuery(format!("text embedding failed: {:#}", e)))?;
        let vector = l2_normalize(vector);
        if vector.iter().all(|x| *x == 0.0) {
            return Err(SearchError::EmptyQuery(
                "text embedding is a zero vector".to_string(),
            ));
        }
        tracing::info!("Text query '{}' encoded ({} dims)", text, vector.len());
        Ok(QueryRepresentation::Embedding(vector))
    }
}

fn encode_category(name: &str) -> Result<QueryRepresentation, SearchError> {
    let label = name.trim().to_lowercase();
    if label.is_empty() {
        return Err(SearchError::EmptyQuery("category is empty".to_string()));
    }
    Ok(QueryRepresentation::Category(label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_solid_png, StubEmbedder};

    #[test]
    fn test_category_is_normalized_without_model() {
        let mut embedder = StubEmbedder::new();
        let query = QueryEncoder::new(&mut embedder)
            .encode(&QueryInput::Category("  Traffic Light ".to_string()))
            .unwrap();
        assert_eq!(
            query,
            QueryRepresentation::Category("traffic light".to_string())
        );
        assert_eq!(embedder.load_count(), 0);
    }

    #[test]
    fn test_blank_inputs_rejected() {
        let mut embedder = StubEmbedder::new();
        let mut encoder = QueryEncoder::new(&mut embedder);
        assert!(matches!(
            encoder.encode(&QueryInput::Text("   ".to_string())),
            Err(SearchError::EmptyQuery(_))
        ));
        assert!(matches!(
            encoder.encode(&QueryInput::Category("".to_string())),
            Err(SearchError::EmptyQuery(_))
        ));
    }

    #[test]
    fn test_text_query_is_unit_length() {
        let mut embedder = StubEmbedder::new();
        let query = QueryEncoder::new(&mut embedder)
            .encode(&QueryInput::Text("red square".to_string()))
            .unwrap();
        assert_eq!(query, QueryRepresentation::Embedding(vec![1.0, 0.0, 0.0]));
    }

    #[test]
    fn test_image_query_averages_decodable_examples() {
        let dir = std::env::temp_dir().join(format!("moment-search-query-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let red = write_solid_png(&dir.join("red.png"), [255, 0, 0]);
        let green = write_solid_png(&dir.join("green.png"), [0, 255, 0]);
        let broken = dir.join("broken.png");
        std::fs::write(&broken, b"not a png").unwrap();

        let mut embedder = StubEmbedder::new();
        let query = QueryEncoder::new(&mut embedder)
            .encode(&QueryInput::Image(vec![red, broken, green]))
            .unwrap();

        let QueryRepresentation::Embedding(v) = query else {
            panic!("expected an embedding query");
        };
        let expected = std::f32::consts::FRAC_1_SQRT_2;
        assert!((v[0] - expected).abs() < 1e-5);
        assert!((v[1] - expected).abs() < 1e-5);
        assert!(v[2].abs() < 1e-6);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_all_unreadable_images_fail_before_loading() {
        let mut embedder = StubEmbedder::new();
        let err = QueryEncoder::new(&mut embedder)
            .encode(&QueryInput::Image(vec![
                PathBuf::from("/nope/a.png"),
                PathBuf::from("/nope/b.jpg"),
            ]))
            .unwrap_err();
        assert!(matches!(err, SearchError::EmptyQuery(_)));
        assert_eq!(embedder.load_count(), 0);
    }

    #[test]
    fn test_model_unavailable_is_reported() {
        let mut embedder = StubEmbedder::unavailable();
        let err = QueryEncoder::new(&mut embedder)
            .encode(&QueryInput::Text("a dog".to_string()))
            .unwrap_err();
        assert!(matches!(err, SearchError::ModelUnavailable { .. }));
    }
}
