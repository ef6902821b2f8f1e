use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

impl From<pictor_core::HostError> for AppError {
    fn from(err: pictor_core::HostError) -> Self {
        use pictor_core::HostError;
        let message = err.to_string();
        match err {
            HostError::BadArchive(_)
            | HostError::MalformedManifest(_)
            | HostError::ManifestInvariantViolated(_)
            | HostError::IdMismatch { .. } => Self::bad_request(message),
            HostError::AlreadyInstalled(_) | HostError::Paused(_) => {
                Self::conflict(message)
            }
            HostError::NotInstalled(_)
            | HostError::NoProvider(_)
            | HostError::UnknownCommand { .. } => Self::not_found(message),
            HostError::NotConnected(_)
            | HostError::ExtensionGone(_)
            | HostError::LimiterStopped => Self::unavailable(message),
            HostError::Forbidden(_) => Self::forbidden(message),
            _ => Self::internal(message),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pictor_core::HostError;
    use pictor_model::ExtensionId;

    #[test]
    fn validation_errors_map_to_400_class() {
        let err: AppError =
            HostError::BadArchive("nope".into()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err: AppError = HostError::AlreadyInstalled(
            ExtensionId::parse("dup").unwrap(),
        )
        .into();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[test]
    fn dispatch_errors_map_to_service_codes() {
        let id = ExtensionId::parse("x").unwrap();
        let err: AppError = HostError::NotConnected(id.clone()).into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        let err: AppError = HostError::Forbidden(id.clone()).into();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        let err: AppError = HostError::NoProvider("TextEmbeddings".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err: AppError =
            HostError::Internal("boom".into()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
