//! Domain types shared by every component.

pub mod source;

pub use source::{LivenessSignal, StreamerSource};
