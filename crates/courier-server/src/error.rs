use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Connection-establishment failures surfaced to the caller. Steady-state
/// store failures are absorbed by the adapters instead: a live channel keeps
/// running on bus-sourced events even while the store is down.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("forbidden")]
    Forbidden,

    #[error("conversation {0} not found")]
    NotFound(i64),

    #[error("event store unavailable: {0}")]
    StoreUnavailable(String),
}

impl ChannelError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ChannelError {
    fn into_response(self) -> Response {
        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ChannelError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ChannelError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(ChannelError::NotFound(9).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ChannelError::StoreUnavailable("down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn not_found_names_the_conversation() {
        assert_eq!(
            ChannelError::NotFound(42).to_string(),
            "conversation 42 not found"
        );
    }
}
