//! Spatialviz.
//!
//! Spatialviz is a web service that renders gene expression plots of spatial transcriptomics
//! datasets. Rendered images are kept in a size-bounded disk cache, and concurrent requests for
//! the same image share a single render.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod endpoints;
mod logging;
mod server;
mod service;

#[cfg(test)]
mod test;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
