//! Domain error to HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::clock::ClockError;
use crate::healing::HealingError;
use crate::scheduler::ScheduleError;
use crate::watch::WatchError;

#[derive(Debug)]
pub enum ApiError {
    Schedule(ScheduleError),
    Healing(HealingError),
    Watch(WatchError),
    BadRequest(String),
}

impl From<ScheduleError> for ApiError {
    fn from(e: ScheduleError) -> Self {
        ApiError::Schedule(e)
    }
}

impl From<HealingError> for ApiError {
    fn from(e: HealingError) -> Self {
        ApiError::Healing(e)
    }
}

impl From<WatchError> for ApiError {
    fn from(e: WatchError) -> Self {
        ApiError::Watch(e)
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Schedule(e) => match e {
                ScheduleError::Clock(ClockError::InvalidTimezone(_)) => (StatusCode::BAD_REQUEST, "InvalidTimezone"),
                ScheduleError::Clock(ClockError::InvalidDateTime { .. }) => (StatusCode::BAD_REQUEST, "InvalidDateTime"),
                ScheduleError::InvalidOptions(_) => (StatusCode::BAD_REQUEST, "InvalidOptions"),
                ScheduleError::NotFound(_) | ScheduleError::RunNotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
                ScheduleError::Conflict { .. } => (StatusCode::CONFLICT, "ScheduleConflict"),
                ScheduleError::RunSealed(_) => (StatusCode::CONFLICT, "RunSealed"),
                ScheduleError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Storage"),
            },
            ApiError::Healing(e) => match e {
                HealingError::LowConfidence { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "HealingLowConfidence"),
                HealingError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "InvalidRequest"),
                HealingError::NotACandidate { .. } => (StatusCode::BAD_REQUEST, "NotACandidate"),
                HealingError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
                HealingError::AlreadyDecided { .. } => (StatusCode::CONFLICT, "AlreadyDecided"),
                HealingError::Superseded { .. } => (StatusCode::CONFLICT, "Superseded"),
                HealingError::QueueFull => (StatusCode::SERVICE_UNAVAILABLE, "QueueFull"),
                HealingError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Storage"),
            },
            ApiError::Watch(e) => match e {
                WatchError::NoPaths(_) => (StatusCode::UNPROCESSABLE_ENTITY, "WatchUnavailable"),
                WatchError::Notify(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Watch"),
            },
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "InvalidRequest"),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Schedule(e) => e.to_string(),
            ApiError::Healing(e) => e.to_string(),
            ApiError::Watch(e) => e.to_string(),
            ApiError::BadRequest(m) => m.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.parts();
        let message = self.message();
        if status.is_server_error() {
            error!(kind, %message, "request failed");
        }
        (status, Json(json!({ "error": { "kind": kind, "message": message } }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                ApiError::from(ScheduleError::Clock(ClockError::InvalidTimezone("Mars/Base".into()))),
                StatusCode::BAD_REQUEST,
            ),
            (ApiError::from(ScheduleError::NotFound("x".into())), StatusCode::NOT_FOUND),
            (
                ApiError::from(ScheduleError::Conflict {
                    id: "x".into(),
                    expected: "scheduled".into(),
                    found: "running".into(),
                }),
                StatusCode::CONFLICT,
            ),
            (ApiError::from(HealingError::NotFound("h".into())), StatusCode::NOT_FOUND),
            (
                ApiError::from(HealingError::Superseded {
                    id: "h".into(),
                    by: "h2".into(),
                }),
                StatusCode::CONFLICT,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
