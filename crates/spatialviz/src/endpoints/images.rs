use axum::body::Body;
use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::Response;
use serde::Deserialize;
use spatialviz_service::types::ImageFormat;

use crate::service::{PlotOptions, RenderService};

use super::ResponseError;

/// The header telling whether an image was served from the cache.
pub const CACHE_HIT_HEADER: &str = "x-cache-hit";

/// Query parameters shared by image requests.
#[derive(Debug, Default, Deserialize)]
pub struct ImageQueryParams {
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub layer: Option<String>,
    #[serde(default)]
    pub basis: Option<String>,
    /// Only used to address TIFF exports when invalidating.
    #[serde(default)]
    pub dpi: Option<u32>,
}

impl ImageQueryParams {
    fn options(self) -> PlotOptions {
        PlotOptions {
            dataset: self.dataset,
            layer: self.layer,
            basis: self.basis,
        }
    }
}

fn parse_format(format: &str) -> Result<ImageFormat, ResponseError> {
    format
        .parse()
        .map_err(|err| ResponseError::bad_input(anyhow::Error::new(err)))
}

/// Serves the PNG preview of a gene, `GET /img/png/{gene}`.
///
/// Exports are only available through `POST /export`.
pub async fn serve_image(
    State(service): State<RenderService>,
    path: Result<Path<(String, String)>, PathRejection>,
    query: Result<Query<ImageQueryParams>, QueryRejection>,
) -> Result<Response, ResponseError> {
    let Path((format, gene)) = path?;
    let Query(params) = query?;

    if parse_format(&format)? != ImageFormat::Png {
        return Err((StatusCode::BAD_REQUEST, "only png images can be viewed, use /export").into());
    }

    sentry::configure_scope(|scope| {
        scope.set_tag("request.format", &format);
        scope.set_tag("request.gene", &gene);
    });

    let image = service.plot_png(&gene, params.options()).await?;
    let response = Response::builder()
        .header(header::CONTENT_TYPE, ImageFormat::Png.mime_type())
        .header(CACHE_HIT_HEADER, if image.cache_hit { "1" } else { "0" })
        .body(Body::from(image.artifact.contents))?;
    Ok(response)
}

/// Drops a cached image, `DELETE /img/{format}/{gene}`.
///
/// Responds with `204 No Content` whether or not the image was cached.
pub async fn invalidate_image(
    State(service): State<RenderService>,
    path: Result<Path<(String, String)>, PathRejection>,
    query: Result<Query<ImageQueryParams>, QueryRejection>,
) -> Result<StatusCode, ResponseError> {
    let Path((format, gene)) = path?;
    let Query(params) = query?;
    let format = parse_format(&format)?;
    let dpi = params.dpi;

    let removed = service.invalidate(&gene, format, dpi, params.options())?;
    tracing::debug!(%gene, %format, removed, "Invalidation requested");
    Ok(StatusCode::NO_CONTENT)
}
