//! Handlers for relay-native command families such as `Cookie.*`.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuxiliaryError {
	#[error("{method} requires {param}")]
	MissingParam { method: String, param: &'static str },

	#[error("Unknown {family} command: {method}")]
	UnknownCommand { family: &'static str, method: String },

	#[error("{0}")]
	NotFound(String),

	#[error("{0}")]
	Failed(String),
}

/// Serves every command whose method starts with [`prefix`](Self::prefix).
#[async_trait]
pub trait AuxiliaryHandler: Send + Sync {
	/// Method prefix including the dot, e.g. `"Cookie."`.
	fn prefix(&self) -> &'static str;

	async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, AuxiliaryError>;
}

/// `params[key]` as a string, or a [`AuxiliaryError::MissingParam`].
pub fn require_str<'a>(
	method: &str,
	params: Option<&'a Value>,
	key: &'static str,
) -> Result<&'a str, AuxiliaryError> {
	params
		.and_then(|p| p.get(key))
		.and_then(Value::as_str)
		.ok_or_else(|| AuxiliaryError::MissingParam {
			method: method.to_string(),
			param: key,
		})
}

/// `params[key]` as an unsigned integer, or a [`AuxiliaryError::MissingParam`].
pub fn require_u64(
	method: &str,
	params: Option<&Value>,
	key: &'static str,
) -> Result<u64, AuxiliaryError> {
	params
		.and_then(|p| p.get(key))
		.and_then(Value::as_u64)
		.ok_or_else(|| AuxiliaryError::MissingParam {
			method: method.to_string(),
			param: key,
		})
}

/// Optional string parameter; values of other types are ignored.
pub fn opt_str<'a>(params: Option<&'a Value>, key: &str) -> Option<&'a str> {
	params.and_then(|p| p.get(key)).and_then(Value::as_str)
}
