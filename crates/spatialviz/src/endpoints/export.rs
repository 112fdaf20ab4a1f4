use axum::body::Body;
use axum::extract::rejection::FormRejection;
use axum::extract::{Form, State};
use axum::http::{HeaderValue, header};
use axum::response::Response;
use serde::Deserialize;
use spatialviz_service::types::ImageFormat;

use crate::service::{PlotOptions, RenderService, sanitize_gene};

use super::ResponseError;

/// Form body of the export request.
#[derive(Debug, Deserialize)]
pub struct ExportForm {
    pub gene: String,
    /// Either `pdf` or `tiff`.
    pub export_type: String,
    /// Required for `tiff`. Browsers submit empty fields, so this is parsed by hand.
    #[serde(default)]
    pub dpi: Option<String>,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub layer: Option<String>,
    #[serde(default)]
    pub basis: Option<String>,
}

/// Renders a gene for download, `POST /export`.
pub async fn export_image(
    State(service): State<RenderService>,
    form: Result<Form<ExportForm>, FormRejection>,
) -> Result<Response, ResponseError> {
    let Form(form) = form?;

    let format: ImageFormat = form
        .export_type
        .parse()
        .map_err(|err| ResponseError::bad_input(anyhow::Error::new(err)))?;
    let dpi = match form.dpi.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(dpi) => Some(dpi.parse::<u32>().map_err(|err| {
            ResponseError::bad_input(anyhow::Error::new(err).context("invalid dpi"))
        })?),
    };

    sentry::configure_scope(|scope| {
        scope.set_tag("request.format", format);
        scope.set_tag("request.gene", &form.gene);
    });

    let options = PlotOptions {
        dataset: form.dataset,
        layer: form.layer,
        basis: form.basis,
    };
    let image = service.export(&form.gene, format, dpi, options).await?;

    // `export` has validated the gene already
    let gene = sanitize_gene(&form.gene)?;
    let filename = match dpi {
        Some(dpi) if format == ImageFormat::Tiff => format!("{gene}_{dpi}.{format}"),
        _ => format!("{gene}.{format}"),
    };

    // genes may contain non-ASCII letters, which only pass as raw header bytes
    let disposition = HeaderValue::from_bytes(
        format!("attachment; filename=\"{filename}\"").as_bytes(),
    )
    .map_err(axum::http::Error::from)?;

    let response = Response::builder()
        .header(header::CONTENT_TYPE, format.mime_type())
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(Body::from(image.artifact.contents))?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use reqwest::{Client, StatusCode};

    use crate::endpoints::error::ApiErrorResponse;
    use crate::test;

    #[tokio::test]
    async fn test_export_pdf() {
        let app = test::app();

        let response = Client::new()
            .post(app.url("/export"))
            .form(&[("gene", "Gfap"), ("export_type", "pdf"), ("dpi", "")])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "application/pdf");
        assert_eq!(
            response.headers()["content-disposition"],
            "attachment; filename=\"Gfap.pdf\""
        );
        assert_eq!(response.text().await.unwrap(), "image for Gfap");
    }

    #[tokio::test]
    async fn test_export_tiff() {
        let app = test::app();
        let client = Client::new();

        let form = [("gene", "HLA DRB1"), ("export_type", "tiff"), ("dpi", "600")];
        let response = client
            .post(app.url("/export"))
            .form(&form)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "image/tiff");
        assert_eq!(
            response.headers()["content-disposition"],
            "attachment; filename=\"HLA_DRB1_600.tiff\""
        );

        // cached, and distinct from the png preview
        client.post(app.url("/export")).form(&form).send().await.unwrap();
        client.get(app.url("/img/png/HLA_DRB1")).send().await.unwrap();
        assert_eq!(app.renders(), 2);
    }

    #[tokio::test]
    async fn test_export_unicode_gene() {
        let app = test::app();

        let response = Client::new()
            .post(app.url("/export"))
            .form(&[("gene", "Grün"), ("export_type", "pdf")])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-disposition"].as_bytes(),
            "attachment; filename=\"Grün.pdf\"".as_bytes()
        );
        assert_eq!(response.text().await.unwrap(), "image for Grün");
    }

    #[tokio::test]
    async fn test_export_validation() {
        let app = test::app();
        let client = Client::new();

        let forms: &[&[(&str, &str)]] = &[
            &[("gene", "Gfap"), ("export_type", "tiff")],
            &[("gene", "Gfap"), ("export_type", "tiff"), ("dpi", "72")],
            &[("gene", "Gfap"), ("export_type", "tiff"), ("dpi", "high")],
            &[("gene", "Gfap"), ("export_type", "png")],
            &[("gene", "  "), ("export_type", "pdf")],
            &[("export_type", "pdf")],
        ];
        for form in forms {
            let response = client
                .post(app.url("/export"))
                .form(form)
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{form:?}");
            let body: ApiErrorResponse = response.json().await.unwrap();
            assert_eq!(body.error.code, "BAD_INPUT");
        }

        let response = client
            .post(app.url("/export"))
            .form(&[("gene", "Gfap"), ("export_type", "tiff"), ("dpi", "72")])
            .send()
            .await
            .unwrap();
        let body: ApiErrorResponse = response.json().await.unwrap();
        assert_eq!(body.error.message, "unsupported dpi");
        assert_eq!(
            body.error.detail.as_deref(),
            Some("allowed=[150, 300, 600, 1200], got=72")
        );

        assert_eq!(app.renders(), 0);
    }
}
