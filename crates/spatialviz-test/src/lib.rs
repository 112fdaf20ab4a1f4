//! Helpers for testing the web server and service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the cache or dataset directory is
//!    deleted while the test still uses it. To avoid this, assign it to a variable in the test
//!    function (e.g. `let cache_dir = test::tempdir()`).
//!
//!  - When using [`Server`], hold it until all requests to it have been made. Dropping it
//!    stops serving.

use std::net::SocketAddr;
use std::path::Path;

use axum::Router;
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the spatialviz crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("spatialviz=trace,spatialviz_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Creates a data directory containing an empty file for each of the given dataset names.
///
/// Plotting backends in tests never read the datasets, they only need to exist.
pub fn datasets(names: &[&str]) -> TempDir {
    let dir = tempdir();
    for name in names {
        std::fs::write(dir.path().join(name), b"").unwrap();
    }
    dir
}

/// Writes a shell script into `dir` that behaves like a plotting backend.
///
/// The script prints `image for <gene>` to stdout. For the gene `Missing` it fails with
/// `GENE_NOT_FOUND`, and for the gene `Broken` it fails without a known code. Every invocation
/// appends a line to `<dir>/invocations`, see [`invocations`].
///
/// Returns the command line to configure.
pub fn plotting_script(dir: &Path) -> Vec<String> {
    let script = dir.join("plot.sh");
    let log = dir.join("invocations");
    let contents = format!(
        r#"#!/bin/sh
gene=""
while [ $# -gt 0 ]; do
    case "$1" in
        --gene) gene="$2"; shift 2 ;;
        *) shift ;;
    esac
done
echo "$gene" >> "{log}"
case "$gene" in
    Missing) echo "GENE_NOT_FOUND: gene $gene not in dataset" >&2; exit 1 ;;
    Broken) echo "Traceback (most recent call last):" >&2; exit 1 ;;
esac
printf 'image for %s' "$gene"
"#,
        log = log.display()
    );
    std::fs::write(&script, contents).unwrap();
    vec!["sh".to_owned(), script.display().to_string()]
}

/// Returns how often the script written by [`plotting_script`] has been run.
pub fn invocations(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join("invocations"))
        .map(|log| log.lines().count())
        .unwrap_or(0)
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server serving the given router.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses the loopback address as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://{}/{}", self.addr(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
