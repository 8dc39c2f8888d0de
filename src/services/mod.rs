pub mod assembler;
pub mod cold_start;
pub mod fallback;
pub mod lease;
pub mod pipeline;
pub mod publisher;
pub mod ratings;
pub mod retry;
pub mod scoring;

pub use pipeline::{JobSettings, RefreshJob};
