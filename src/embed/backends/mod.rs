pub mod histogram;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use histogram::HistogramEmbedder;

#[cfg(feature = "backend-tract")]
pub use tract::TractClipEmbedder;
