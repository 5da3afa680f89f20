use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use moment_search::search::{QueryInput, SearchMode};
use moment_search::{ModelConfig, SearchConfig};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// JSON file with search settings (thresholds, sampling, dedup window)
    #[arg(long, global = true, env = "MOMENT_SEARCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Decode backend: opencv or ffmpeg
    #[arg(long, global = true, env = "MOMENT_SEARCH_BACKEND")]
    pub backend: Option<String>,

    /// CLIP variant used for image and text queries
    #[arg(
        long,
        global = true,
        default_value = "clip-vit-b32",
        env = "MOMENT_SEARCH_CLIP_VARIANT"
    )]
    pub clip_variant: String,

    /// ONNX detector used for category queries
    #[arg(
        long,
        global = true,
        default_value = "rtdetr-v2-s-coco.onnx",
        env = "MOMENT_SEARCH_DETECTOR_MODEL"
    )]
    pub detector_model: String,

    /// Run inference on the CPU even when an accelerator is available
    #[arg(long, global = true)]
    pub cpu_only: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search videos from the terminal
    Search(SearchArgs),
    /// Serve the search API over HTTP
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
pub struct SearchArgs {
    /// Video files or directories to search
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// image, text or category
    #[arg(long, short)]
    pub mode: SearchMode,

    /// Example image paths, a description, or a category name
    #[arg(long, short, required = true, num_args = 1..)]
    pub query: Vec<String>,

    /// Minimum score for a match (defaults depend on the mode)
    #[arg(long)]
    pub threshold: Option<f32>,

    /// Seconds between inspected frames
    #[arg(long)]
    pub interval: Option<f64>,

    /// Minimum seconds between two matches in the same video
    #[arg(long)]
    pub dedup_window: Option<f64>,

    /// Also write matches to this CSV file
    #[arg(long)]
    pub csv: Option<PathBuf>,

    /// Print matches as JSON lines
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1", env = "MOMENT_SEARCH_HOST")]
    pub host: IpAddr,

    /// Port to bind to
    #[arg(long, default_value_t = 12207, env = "MOMENT_SEARCH_PORT")]
    pub port: u16,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn search_config(&self) -> Result<SearchConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {:?}", path))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("Invalid config {:?}", path))?
            }
            None => SearchConfig::default(),
        };
        if let Some(backend) = &self.backend {
            config.backend = backend.clone();
        }
        Ok(config)
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            clip_variant: self.clip_variant.clone(),
            detector_model: self.detector_model.clone(),
            accelerate: !self.cpu_only,
        }
    }
}

impl SearchArgs {
    pub fn query_input(&self) -> QueryInput {
        match self.mode {
            SearchMode::Image => QueryInput::Image(self.query.iter().map(PathBuf::from).collect()),
            SearchMode::Text => QueryInput::Text(self.query.join(" ")),
            SearchMode::Category => QueryInput::Category(self.query.join(" ")),
        }
    }

    pub fn apply_overrides(&self, config: &mut SearchConfig) {
        if let Some(interval) = self.interval {
            config.sample_interval_secs = interval;
        }
        if let Some(window) = self.dedup_window {
            config.dedup_window_secs = window;
        }
    }
}
