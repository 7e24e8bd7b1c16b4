//! srec-orchestrator library crate.
//!
//! Drives live-stream recordings end to end: egress selection over a proxy
//! pool, capture process supervision, remux with fallback strategies and
//! recovery of orphaned raw artifacts.

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod orphan;
pub mod process;
pub mod proxy;
pub mod recording;
pub mod remux;
pub mod status;
pub mod utils;

pub use error::{Error, Result};
