mod backend;
pub mod backends;
mod service;

pub use backend::{l2_normalize, RegionEmbedder};
pub use backends::HistogramEmbedder;
pub use service::{EmbedderLoader, EmbedderState, EmbeddingService};
