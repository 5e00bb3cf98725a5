use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Serialize;

use crate::persist::StoreError;
use crate::registry::RegistryError;
use crate::session::SessionError;

/// Wire shape of every control-plane error.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
	#[serde(rename = "type")]
	pub kind: &'static str,
	pub status: &'static str,
	pub code: &'static str,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub details: Option<serde_json::Value>,
	pub timestamp: String,
}

/// A control-plane error carrying its HTTP status and stable error code.
#[derive(Debug)]
pub struct ApiError {
	pub status: StatusCode,
	pub code: &'static str,
	pub message: String,
	pub details: Option<serde_json::Value>,
}

impl ApiError {
	pub fn bad_request(message: impl Into<String>) -> Self {
		Self {
			status: StatusCode::BAD_REQUEST,
			code: "INVALID_REQUEST",
			message: message.into(),
			details: None,
		}
	}

	pub fn unauthorized(message: impl Into<String>) -> Self {
		Self {
			status: StatusCode::UNAUTHORIZED,
			code: "UNAUTHORIZED",
			message: message.into(),
			details: None,
		}
	}

	pub fn invalid_cert(message: impl Into<String>) -> Self {
		Self {
			status: StatusCode::UNAUTHORIZED,
			code: "INVALID_CERT",
			message: message.into(),
			details: None,
		}
	}

	pub fn policy_denied(reason: impl Into<String>) -> Self {
		Self {
			status: StatusCode::FORBIDDEN,
			code: "POLICY_DENIED",
			message: reason.into(),
			details: None,
		}
	}

	pub fn not_found(message: impl Into<String>) -> Self {
		Self {
			status: StatusCode::NOT_FOUND,
			code: "NOT_FOUND",
			message: message.into(),
			details: None,
		}
	}

	pub fn concurrency_limit(message: impl Into<String>) -> Self {
		Self {
			status: StatusCode::TOO_MANY_REQUESTS,
			code: "CONCURRENCY_LIMIT",
			message: message.into(),
			details: None,
		}
	}

	pub fn internal(message: impl Into<String>) -> Self {
		Self {
			status: StatusCode::INTERNAL_SERVER_ERROR,
			code: "INTERNAL_ERROR",
			message: message.into(),
			details: None,
		}
	}

	pub fn unavailable(message: impl Into<String>) -> Self {
		Self {
			status: StatusCode::SERVICE_UNAVAILABLE,
			code: "SERVICE_UNAVAILABLE",
			message: message.into(),
			details: None,
		}
	}

	pub fn with_details(mut self, details: serde_json::Value) -> Self {
		self.details = Some(details);
		self
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let body = ErrorBody {
			kind: "error",
			status: "error",
			code: self.code,
			message: self.message,
			details: self.details,
			timestamp: Utc::now().to_rfc3339(),
		};
		(self.status, Json(body)).into_response()
	}
}

impl From<SessionError> for ApiError {
	fn from(err: SessionError) -> Self {
		match err {
			SessionError::BadRequest(msg) => Self::bad_request(msg),
			SessionError::NotFound | SessionError::Expired => {
				Self::unauthorized(err.to_string())
			}
		}
	}
}

impl From<RegistryError> for ApiError {
	fn from(err: RegistryError) -> Self {
		match err {
			RegistryError::NotFound | RegistryError::Expired => Self::not_found(err.to_string()),
			RegistryError::Terminal(_) => Self::bad_request(err.to_string()),
		}
	}
}

impl From<StoreError> for ApiError {
	fn from(err: StoreError) -> Self {
		Self::unavailable(err.to_string())
	}
}
