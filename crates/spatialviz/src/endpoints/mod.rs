use axum::Router;
use axum::routing::{get, post};
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

use crate::service::RenderService;

mod error;
mod export;
mod health;
mod images;
mod metrics;

pub use error::ResponseError;
use metrics::MetricsLayer;

use export::export_image;
use health::health;
use images::{invalidate_image, serve_image};

pub async fn healthcheck() -> &'static str {
    spatialviz_service::metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: RenderService) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer);
    Router::new()
        .route("/img/:format/:gene", get(serve_image).delete(invalidate_image))
        .route("/export", post(export_image))
        .route("/health", get(health))
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}

#[cfg(test)]
mod tests {
    use reqwest::{Client, StatusCode};

    use crate::test;

    #[tokio::test]
    async fn test_healthcheck() {
        let app = test::app();

        let response = Client::new()
            .get(app.url("/healthcheck"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let app = test::app();

        let response = Client::new()
            .get(app.url("/plot/Gfap"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
