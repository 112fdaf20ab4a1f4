//! Core of the spatialviz render service.
//!
//! Renders gene expression images for spatial transcriptomics datasets through an external
//! plotting backend, and keeps the rendered images in a size-bounded disk cache.
//! See the [`caching`] module for how renders are deduplicated, stored and evicted.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod plotting;
pub mod types;
