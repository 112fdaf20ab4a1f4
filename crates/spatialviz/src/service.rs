//! Turns HTTP level input into [`RenderRequest`]s, and hands them to the [`RenderCoordinator`].
//!
//! Requests arrive on the web runtime. Renders are spawned on the `cpu_pool` handed to
//! [`RenderService::create`], and keep running there even if the client goes away.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use spatialviz_service::caching::{
    CacheStore, EvictionPolicy, RenderCoordinator, RenderError, RenderedImage,
};
use spatialviz_service::config::Config;
use spatialviz_service::plotting::{
    CommandBackend, PlottingBackend, PlottingError, PlottingErrorKind,
};
use spatialviz_service::types::{ImageFormat, RenderRequest};
use tokio::runtime::Handle;

/// The file extension of datasets.
const DATASET_EXTENSION: &str = "h5ad";

/// Optional plotting parameters a client may pass.
#[derive(Debug, Default, Clone)]
pub struct PlotOptions {
    pub dataset: Option<String>,
    pub layer: Option<String>,
    pub basis: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RenderService {
    inner: Arc<RenderServiceInner>,
}

#[derive(Debug)]
struct RenderServiceInner {
    config: Config,
    coordinator: RenderCoordinator,
}

impl RenderService {
    /// Opens the render cache and sets up the configured plotting command.
    ///
    /// Clears leftover temporary files and rebuilds the cache index from disk.
    pub fn create(config: Config, cpu_pool: Handle) -> Result<Self> {
        let backend = CommandBackend::from_config(&config.plotting, &config.datasets.data_dir)
            .context("no plotting command configured")?;
        Self::with_backend(config, Arc::new(backend), cpu_pool)
    }

    pub fn with_backend(
        config: Config,
        backend: Arc<dyn PlottingBackend>,
        cpu_pool: Handle,
    ) -> Result<Self> {
        let store = CacheStore::from_config(&config).context("failed to open the render cache")?;
        store
            .clear_tmp()
            .context("failed to clear temporary files")?;
        store
            .load_from_disk()
            .context("failed to load the render cache")?;
        let store = Arc::new(store);

        let renders_config = &config.caches.renders;
        let eviction = Arc::new(EvictionPolicy::new(Arc::clone(&store), renders_config));
        let coordinator =
            RenderCoordinator::new(store, backend, eviction, renders_config, cpu_pool);

        Ok(Self {
            inner: Arc::new(RenderServiceInner {
                config,
                coordinator,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        self.inner.coordinator.store()
    }

    pub fn eviction(&self) -> &Arc<EvictionPolicy> {
        self.inner.coordinator.eviction()
    }

    /// Returns the PNG preview of `gene`, rendered in the configured resolution.
    pub async fn plot_png(
        &self,
        gene: &str,
        options: PlotOptions,
    ) -> Result<RenderedImage, RenderError> {
        let dpi = self.config().datasets.plot_png_dpi;
        let request = self.build_request(gene, ImageFormat::Png, Some(dpi), options)?;
        self.render(request).await
    }

    /// Returns a PDF or TIFF export of `gene`.
    ///
    /// TIFF exports need a `dpi` out of the configured choices. PDF is vector output, any `dpi`
    /// is ignored.
    pub async fn export(
        &self,
        gene: &str,
        format: ImageFormat,
        dpi: Option<u32>,
        options: PlotOptions,
    ) -> Result<RenderedImage, RenderError> {
        let dpi = match format {
            ImageFormat::Png => return Err(bad_input("export type must be `pdf` or `tiff`").into()),
            ImageFormat::Pdf => None,
            ImageFormat::Tiff => Some(self.export_dpi(dpi)?),
        };
        let request = self.build_request(gene, format, dpi, options)?;
        self.render(request).await
    }

    /// Removes the cached image that a request with these parameters would return.
    pub fn invalidate(
        &self,
        gene: &str,
        format: ImageFormat,
        dpi: Option<u32>,
        options: PlotOptions,
    ) -> Result<bool, RenderError> {
        let dpi = match format {
            ImageFormat::Png => Some(dpi.unwrap_or(self.config().datasets.plot_png_dpi)),
            ImageFormat::Pdf => None,
            ImageFormat::Tiff => Some(self.export_dpi(dpi)?),
        };
        let request = self.build_request(gene, format, dpi, options)?;
        self.inner.coordinator.invalidate(&request)
    }

    async fn render(&self, request: RenderRequest) -> Result<RenderedImage, RenderError> {
        let image = self.inner.coordinator.get_or_render(request.clone()).await?;
        tracing::info!(
            dataset = %request.dataset_id,
            gene = %request.gene,
            format = %request.format,
            cache_hit = image.cache_hit,
            "Served image"
        );
        Ok(image)
    }

    fn build_request(
        &self,
        gene: &str,
        format: ImageFormat,
        dpi: Option<u32>,
        options: PlotOptions,
    ) -> Result<RenderRequest, PlottingError> {
        let datasets = &self.config().datasets;
        let gene = sanitize_gene(gene)?;
        let dataset = self.resolve_dataset(options.dataset.as_deref())?;
        let layer = non_empty(options.layer).unwrap_or_else(|| datasets.default_layer.clone());
        let basis = non_empty(options.basis).unwrap_or_else(|| datasets.default_basis.clone());

        let mut request = RenderRequest::new(dataset, gene, format)
            .with_param("layer", layer)
            .with_param("basis", basis);
        if let Some(dpi) = dpi {
            request = request.with_param("dpi", dpi);
        }
        Ok(request)
    }

    fn export_dpi(&self, dpi: Option<u32>) -> Result<u32, PlottingError> {
        let allowed = &self.config().datasets.allowed_export_dpi;
        let Some(dpi) = dpi else {
            return Err(bad_input("a tiff export needs a dpi"));
        };
        if dpi == 0 || !allowed.contains(&dpi) {
            return Err(bad_input("unsupported dpi")
                .with_detail(format!("allowed={allowed:?}, got={dpi}")));
        }
        Ok(dpi)
    }

    /// Returns the file name of the dataset to plot, checking that it exists.
    ///
    /// Without an explicit choice, this is the configured default dataset, or the first dataset
    /// in the data directory, sorted by name.
    fn resolve_dataset(&self, requested: Option<&str>) -> Result<String, PlottingError> {
        let datasets = &self.config().datasets;
        let name = match requested.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => name.to_owned(),
            None => match &datasets.default_dataset {
                Some(name) => name.clone(),
                None => first_dataset(&datasets.data_dir)?,
            },
        };

        // datasets are addressed by file name, never by path
        if name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(bad_input("invalid dataset name").with_detail(name));
        }
        let file_name = if Path::new(&name)
            .extension()
            .is_some_and(|ext| ext == DATASET_EXTENSION)
        {
            name
        } else {
            format!("{name}.{DATASET_EXTENSION}")
        };

        let path = datasets.data_dir.join(&file_name);
        if !path.is_file() {
            return Err(PlottingError::new(
                PlottingErrorKind::DatasetNotFound,
                format!("dataset file does not exist: {file_name}"),
            )
            .with_detail(path.display().to_string()));
        }
        Ok(file_name)
    }
}

/// Trims `gene` and replaces every character that is not alphanumeric, `.`, `_` or `-` with
/// `_`. Alphanumeric includes non-ASCII letters and digits.
pub fn sanitize_gene(gene: &str) -> Result<String, PlottingError> {
    let gene = gene.trim();
    if gene.is_empty() {
        return Err(bad_input("gene must not be empty"));
    }
    Ok(gene
        .chars()
        .map(|c| match c {
            '.' | '_' | '-' => c,
            c if c.is_alphanumeric() => c,
            _ => '_',
        })
        .collect())
}

fn first_dataset(data_dir: &Path) -> Result<String, PlottingError> {
    let not_found = |message: &str| {
        PlottingError::new(PlottingErrorKind::DatasetNotFound, message)
            .with_detail(data_dir.display().to_string())
    };

    let entries = std::fs::read_dir(data_dir).map_err(|_| not_found("data directory does not exist"))?;
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| path.extension().is_some_and(|ext| ext == DATASET_EXTENSION))
        .filter_map(|path| path.file_name()?.to_str().map(str::to_owned))
        .collect();
    names.sort();

    names
        .into_iter()
        .next()
        .ok_or_else(|| not_found("no dataset found in the data directory"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn bad_input(message: &str) -> PlottingError {
    PlottingError::new(PlottingErrorKind::BadInput, message)
}

#[cfg(test)]
mod tests {
    use crate::test;

    use super::*;

    fn config(data_dir: &Path, cache_dir: &Path) -> Config {
        let mut config = Config {
            cache_dir: cache_dir.to_path_buf(),
            ..Default::default()
        };
        config.datasets.data_dir = data_dir.to_path_buf();
        config.plotting.command = test::plotting_script(cache_dir);
        config
    }

    #[test]
    fn test_sanitize_gene() {
        assert_eq!(sanitize_gene(" Gfap ").unwrap(), "Gfap");
        assert_eq!(sanitize_gene("HLA-DRB1").unwrap(), "HLA-DRB1");
        assert_eq!(sanitize_gene("a/b c").unwrap(), "a_b_c");
        assert_eq!(sanitize_gene("../etc").unwrap(), ".._etc");
        assert_eq!(sanitize_gene("Grün").unwrap(), "Grün");
        assert_eq!(sanitize_gene("Gen²").unwrap(), "Gen²");
        assert_eq!(sanitize_gene("a;b\u{200b}").unwrap(), "a_b_");

        let err = sanitize_gene("   ").unwrap_err();
        assert_eq!(err.kind, PlottingErrorKind::BadInput);
    }

    #[tokio::test]
    async fn test_resolve_dataset() {
        test::setup();
        let data_dir = test::datasets(&["sham.h5ad", "MCAO_1d.h5ad", "notes.txt"]);
        let cache_dir = test::tempdir();
        let config = config(data_dir.path(), cache_dir.path());
        let service = RenderService::create(config, Handle::current()).unwrap();

        // sorted by name, upper case first
        assert_eq!(service.resolve_dataset(None).unwrap(), "MCAO_1d.h5ad");
        assert_eq!(service.resolve_dataset(Some(" ")).unwrap(), "MCAO_1d.h5ad");
        assert_eq!(service.resolve_dataset(Some("sham")).unwrap(), "sham.h5ad");
        assert_eq!(service.resolve_dataset(Some("sham.h5ad")).unwrap(), "sham.h5ad");

        let err = service.resolve_dataset(Some("stroke")).unwrap_err();
        assert_eq!(err.kind, PlottingErrorKind::DatasetNotFound);
        let err = service.resolve_dataset(Some("../sham")).unwrap_err();
        assert_eq!(err.kind, PlottingErrorKind::BadInput);
    }

    #[tokio::test]
    async fn test_default_dataset() {
        test::setup();
        let data_dir = test::datasets(&["sham.h5ad", "MCAO_1d.h5ad"]);
        let cache_dir = test::tempdir();
        let mut config = config(data_dir.path(), cache_dir.path());
        config.datasets.default_dataset = Some("sham".into());
        let service = RenderService::create(config, Handle::current()).unwrap();
        assert_eq!(service.resolve_dataset(None).unwrap(), "sham.h5ad");

        let empty_dir = test::tempdir();
        let config = self::config(empty_dir.path(), cache_dir.path());
        let service = RenderService::create(config, Handle::current()).unwrap();
        let err = service.resolve_dataset(None).unwrap_err();
        assert_eq!(err.kind, PlottingErrorKind::DatasetNotFound);
    }

    #[tokio::test]
    async fn test_requests() {
        test::setup();
        let data_dir = test::datasets(&["sham.h5ad"]);
        let cache_dir = test::tempdir();
        let config = config(data_dir.path(), cache_dir.path());
        let service = RenderService::create(config, Handle::current()).unwrap();

        let request = service
            .build_request("Gfap", ImageFormat::Png, Some(300), PlotOptions::default())
            .unwrap();
        insta::assert_debug_snapshot!(request, @r###"
        RenderRequest {
            dataset_id: "sham.h5ad",
            gene: "Gfap",
            format: Png,
            params: {
                "basis": Str(
                    "spatial",
                ),
                "dpi": Int(
                    300,
                ),
                "layer": Str(
                    "lognorm",
                ),
            },
        }
        "###);

        assert_eq!(service.export_dpi(Some(600)).unwrap(), 600);
        assert_eq!(
            service.export_dpi(Some(72)).unwrap_err().kind,
            PlottingErrorKind::BadInput
        );
        assert_eq!(
            service.export_dpi(None).unwrap_err().kind,
            PlottingErrorKind::BadInput
        );
    }

    #[test]
    fn test_missing_plotting_command() {
        let cache_dir = test::tempdir();
        let mut config = config(cache_dir.path(), cache_dir.path());
        config.plotting.command.clear();
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        assert!(RenderService::create(config, runtime.handle().clone()).is_err());
    }
}
