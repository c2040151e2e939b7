use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use berth_core::registry::RegistryError;
use berth_core::stack::StackPathError;
use serde_json::json;
use std::fmt;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
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
        let body = match self.code {
            Some(code) => Json(json!({ "error": self.message, "code": code })),
            None => Json(json!({ "error": self.message })),
        };
        (self.status, body).into_response()
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        let code = err.code();
        let status = match &err {
            RegistryError::Validation(_) | RegistryError::ReservedStack(_) => {
                StatusCode::BAD_REQUEST
            }
            RegistryError::StackPath(path_err) => match path_err {
                StackPathError::NotFound(_) => StatusCode::NOT_FOUND,
                StackPathError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::BAD_REQUEST,
            },
            // Conflicts surface as 500 with a message naming the running
            // operation id.
            RegistryError::Conflict { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        Self::new(status, err.to_string()).with_code(code)
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
    use berth_core::validate::{OperationRequest, validate_request};

    #[test]
    fn validation_errors_map_to_400_with_code() {
        let err = validate_request(&OperationRequest::new("exec")).unwrap_err();
        let app: AppError = AppError::from(RegistryError::from(err));
        assert_eq!(app.status, StatusCode::BAD_REQUEST);
        assert_eq!(app.code, Some("unknown-operation"));
    }

    #[test]
    fn conflict_maps_to_500_and_names_the_operation() {
        let app: AppError = AppError::from(RegistryError::Conflict {
            stack_name: "web".to_string(),
            operation_id: "op-123".to_string(),
        });
        assert_eq!(app.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(app.message.contains("op-123"));
        assert!(app.message.contains("web"));
    }
}
