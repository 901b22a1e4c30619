use {
  crate::{model::ValidationError, wire::ErrorBody},
  serde_json::Value,
  std::fmt::Display,
  thiserror::Error,
  tracing::error,
};

/// A domain-level failure that crosses the RPC boundary.
///
/// Handlers return it to have the router emit an error response;
/// `request()` raises it when the remote side answered with one.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{message}")]
pub struct RpcError {
  pub message: String,
  pub data: Option<Value>,
}

impl RpcError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      data: None,
    }
  }

  pub fn with_data(message: impl Into<String>, data: Value) -> Self {
    Self {
      message: message.into(),
      data: Some(data),
    }
  }

  pub fn not_supported(method: &str) -> Self {
    Self::new(format!("{method} not supported"))
  }

  /// Logs the underlying failure and hides it from the caller.
  pub fn internal(err: impl Display) -> Self {
    error!("internal server error: {err}");
    Self::new("internal server error")
  }
}

impl From<ValidationError> for RpcError {
  fn from(err: ValidationError) -> Self {
    Self::new(err.to_string())
  }
}

impl From<ErrorBody> for RpcError {
  fn from(body: ErrorBody) -> Self {
    Self {
      message: body.message,
      data: body.data,
    }
  }
}

impl From<RpcError> for ErrorBody {
  fn from(err: RpcError) -> Self {
    Self {
      message: err.message,
      data: err.data,
    }
  }
}
