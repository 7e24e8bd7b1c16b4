//! Post-capture container remux with fallback strategies.

pub mod artifact;
pub mod pipeline;
pub mod probe;
pub mod strategy;

pub use artifact::{ArtifactStatus, PostProcessArtifact};
pub use pipeline::{RemuxPipeline, RemuxReport, RemuxSettings};
pub use probe::{FfprobeProber, MediaProber};
pub use strategy::{RemuxInput, RemuxStrategy};
