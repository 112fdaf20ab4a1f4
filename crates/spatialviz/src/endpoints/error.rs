use axum::Json;
use axum::extract::rejection::{FormRejection, PathRejection, QueryRejection};
use axum::http::{Error as HttpError, StatusCode};
use axum::response::{IntoResponse, Response};
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};
use spatialviz_service::caching::RenderError;
use spatialviz_service::plotting::{PlottingError, PlottingErrorKind};

/// The code of errors that are not caused by the request.
const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    code: &'static str,
    detail: Option<String>,
    err: anyhow::Error,
}

impl ResponseError {
    pub fn bad_input(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: PlottingErrorKind::BadInput.code(),
            detail: None,
            err,
        }
    }
}

impl From<PlottingError> for ResponseError {
    fn from(err: PlottingError) -> Self {
        let status = match err.kind {
            PlottingErrorKind::BadInput
            | PlottingErrorKind::GeneNotFound
            | PlottingErrorKind::LayerNotFound => StatusCode::BAD_REQUEST,
            PlottingErrorKind::DatasetNotFound => StatusCode::NOT_FOUND,
            PlottingErrorKind::Failed => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.kind.code(),
            detail: err.detail,
            err: anyhow::Error::msg(err.message),
        }
    }
}

impl From<RenderError> for ResponseError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::Plotting(err) => err.into(),
            RenderError::InvalidRequest(_) => Self::bad_input(err.into()),
            RenderError::StoreCorruption(_)
            | RenderError::EvictionFailure(_)
            | RenderError::InternalError => anyhow::Error::from(err).into(),
        }
    }
}

impl From<FormRejection> for ResponseError {
    fn from(err: FormRejection) -> Self {
        Self::bad_input(anyhow::Error::msg(err.body_text()))
    }
}

impl From<QueryRejection> for ResponseError {
    fn from(err: QueryRejection) -> Self {
        Self::bad_input(anyhow::Error::msg(err.body_text()))
    }
}

impl From<PathRejection> for ResponseError {
    fn from(err: PathRejection) -> Self {
        Self::bad_input(anyhow::Error::msg(err.body_text()))
    }
}

impl From<(StatusCode, &'static str)> for ResponseError {
    fn from((status, msg): (StatusCode, &'static str)) -> Self {
        let code = if status.is_client_error() {
            PlottingErrorKind::BadInput.code()
        } else {
            INTERNAL_ERROR
        };
        Self {
            status,
            code,
            detail: None,
            err: anyhow::anyhow!(msg),
        }
    }
}

impl From<anyhow::Error> for ResponseError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: INTERNAL_ERROR,
            detail: None,
            err,
        }
    }
}

impl From<HttpError> for ResponseError {
    fn from(err: HttpError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: INTERNAL_ERROR,
            detail: None,
            err: err.into(),
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            capture_anyhow(&self.err);
        } else {
            tracing::debug!(code = self.code, "Rejected request: {}", self.err);
        }

        let body = ApiErrorResponse {
            ok: false,
            error: ApiError::new(self.code, self.err, self.detail),
        };
        let mut response = Json(body).into_response();
        *response.status_mut() = self.status;
        response
    }
}

/// An error response from the api.
#[derive(Serialize, Deserialize, Debug)]
pub struct ApiErrorResponse {
    pub ok: bool,
    pub error: ApiError,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
}

impl ApiError {
    /// Uses the outermost error as message. Underlying causes become the detail, unless an
    /// explicit detail is given.
    fn new(code: &str, err: anyhow::Error, detail: Option<String>) -> Self {
        let mut chain = err.chain().map(|err| err.to_string());
        let message = chain.next().unwrap_or_default();
        let causes: Vec<_> = chain.collect();
        let detail = match detail {
            Some(detail) => Some(detail),
            None if causes.is_empty() => None,
            None => Some(causes.join(": ")),
        };

        ApiError {
            code: code.to_owned(),
            message,
            detail,
        }
    }
}
