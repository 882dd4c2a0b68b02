use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

pub type AppResult<T> = Result<T, AppError>;

/// Handler error: an anyhow chain plus the status it should surface as.
/// Anything converted via `?` lands on 500; authorization and validation
/// failures use the constructors below.
pub struct AppError {
    status: StatusCode,
    source: anyhow::Error,
}

impl AppError {
    fn with_status(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            source: anyhow::Error::msg(msg.into()),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::with_status(StatusCode::UNAUTHORIZED, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::with_status(StatusCode::FORBIDDEN, msg)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(error = ?self.source, "request failed");
            (
                self.status,
                format!("{}\n\n{}", self.source, self.source.backtrace()),
            )
                .into_response()
        } else {
            (self.status, self.source.to_string()).into_response()
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            source: err.into(),
        }
    }
}
