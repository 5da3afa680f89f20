//! Find the moments in a set of videos that match an example image, a text
//! description or an object category.

pub mod config;
pub mod error;
pub mod models;
pub mod search;
pub mod video;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ModelConfig, SearchConfig};
pub use error::{ErrorScope, SearchError};
