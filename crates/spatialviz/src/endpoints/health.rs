use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::service::RenderService;

/// Service status, as reported by `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub version: &'static str,
    pub data_dir: String,
    pub cache_dir: String,
    pub default_dataset: Option<String>,
    pub default_layer: String,
    pub default_basis: String,
    pub plot_png_dpi: u32,
    pub allowed_export_dpi: Vec<u32>,
    pub cache: CacheHealth,
}

#[derive(Debug, Serialize)]
pub struct CacheHealth {
    pub entries: usize,
    pub size_bytes: u64,
    pub max_cache_size: u64,
    pub evict_on_write: bool,
}

pub async fn health(State(service): State<RenderService>) -> Json<HealthResponse> {
    let config = service.config();
    let datasets = &config.datasets;
    let renders = &config.caches.renders;
    let store = service.store();

    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
        data_dir: datasets.data_dir.display().to_string(),
        cache_dir: store.cache_dir().display().to_string(),
        default_dataset: datasets.default_dataset.clone(),
        default_layer: datasets.default_layer.clone(),
        default_basis: datasets.default_basis.clone(),
        plot_png_dpi: datasets.plot_png_dpi,
        allowed_export_dpi: datasets.allowed_export_dpi.clone(),
        cache: CacheHealth {
            entries: store.len(),
            size_bytes: store.total_size(),
            max_cache_size: renders.max_cache_size,
            evict_on_write: renders.evict_on_write,
        },
    })
}

#[cfg(test)]
mod tests {
    use reqwest::{Client, StatusCode};
    use serde_json::Value;

    use crate::test;

    #[tokio::test]
    async fn test_health() {
        let app = test::app_with_config(|config| {
            config.datasets.default_dataset = Some("sham".into());
            config.caches.renders.max_cache_size = 1024;
        });
        let client = Client::new();

        client.get(app.url("/img/png/Gfap")).send().await.unwrap();

        let response = client.get(app.url("/health")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.unwrap();

        assert_eq!(body["ok"], true);
        assert_eq!(body["default_dataset"], "sham");
        assert_eq!(body["default_layer"], "lognorm");
        assert_eq!(body["plot_png_dpi"], 300);
        assert_eq!(
            body["data_dir"],
            app.data_dir.path().display().to_string().as_str()
        );
        assert_eq!(body["cache"]["entries"], 1);
        assert_eq!(body["cache"]["size_bytes"], "image for Gfap".len());
        assert_eq!(body["cache"]["max_cache_size"], 1024);
    }
}
