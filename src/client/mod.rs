//! HTTP clients for extraction endpoints.

mod vision;

pub use vision::{VisionClient, VisionExtraction};
