//! Helpers for testing the web server.
//!
//! In addition to everything from [`spatialviz_test`], this provides [`app`], which starts the
//! full web app on a test server, with the plotting command replaced by a shell script.

use reqwest::Url;
use spatialviz_service::config::Config;
use tokio::runtime::Handle;

use crate::endpoints;
use crate::service::RenderService;

pub use spatialviz_test::*;

/// A running web app, and the directories it works in.
///
/// The data directory contains the datasets `MCAO_1d.h5ad` and `sham.h5ad`.
pub struct TestApp {
    pub server: Server,
    pub service: RenderService,
    pub data_dir: TempDir,
    pub cache_dir: TempDir,
    pub script_dir: TempDir,
}

impl TestApp {
    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }

    /// How often the plotting command has been run.
    pub fn renders(&self) -> usize {
        invocations(self.script_dir.path())
    }
}

/// Starts the web app with the default configuration, see [`TestApp`].
pub fn app() -> TestApp {
    app_with_config(|_| {})
}

/// Starts the web app, allowing to adjust the configuration first.
pub fn app_with_config(configure: impl FnOnce(&mut Config)) -> TestApp {
    setup();

    let data_dir = datasets(&["sham.h5ad", "MCAO_1d.h5ad"]);
    let cache_dir = tempdir();
    let script_dir = tempdir();

    let mut config = Config {
        cache_dir: cache_dir.path().to_path_buf(),
        ..Default::default()
    };
    config.datasets.data_dir = data_dir.path().to_path_buf();
    config.plotting.command = plotting_script(script_dir.path());
    configure(&mut config);

    let service = RenderService::create(config, Handle::current()).unwrap();
    let server = Server::with_router(endpoints::create_app(service.clone()));

    TestApp {
        server,
        service,
        data_dir,
        cache_dir,
        script_dir,
    }
}
