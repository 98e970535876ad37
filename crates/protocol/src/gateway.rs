//! Gateway handshake frames.
//!
//! Some relay peers front the control connection with a gateway that
//! challenges the bridge right after the websocket opens:
//!
//! 1. Gateway sends [`GatewayFrame::Event`] named `connect.challenge` with a nonce
//! 2. Bridge answers with a [`GatewayFrame::Req`] `connect` request carrying
//!    the derived relay token
//! 3. Gateway replies with [`GatewayFrame::Res`]; `ok: false` means the bridge
//!    must close the connection
//!
//! Unlike the envelope frames in [`crate::frame`], these carry a `type` tag.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Name of the challenge event that starts the handshake.
pub const CONNECT_CHALLENGE: &str = "connect.challenge";

/// Protocol revision the bridge negotiates.
pub const GATEWAY_PROTOCOL: u32 = 3;

/// Client identifier presented to the gateway.
pub const CLIENT_ID: &str = "pw-bridge";

/// Close code used when the gateway rejects the handshake.
pub const POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayFrame {
	/// Gateway-originated event.
	Event {
		event: String,
		#[serde(default)]
		payload: Value,
	},
	/// Request, sent by the bridge.
	Req {
		id: String,
		method: String,
		#[serde(default)]
		params: Value,
	},
	/// Reply to a [`GatewayFrame::Req`].
	Res {
		id: String,
		#[serde(default)]
		ok: bool,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		error: Option<Value>,
	},
}

impl GatewayFrame {
	/// Returns the trimmed nonce when this is a `connect.challenge` event.
	///
	/// The outer `Option` says whether this is a challenge at all; the inner
	/// one is `None` when the gateway sent no usable nonce.
	pub fn challenge_nonce(&self) -> Option<Option<String>> {
		match self {
			GatewayFrame::Event { event, payload } if event == CONNECT_CHALLENGE => Some(
				payload
					.get("nonce")
					.and_then(Value::as_str)
					.map(str::trim)
					.filter(|n| !n.is_empty())
					.map(str::to_owned),
			),
			_ => None,
		}
	}

	/// Builds the `connect` request answering a challenge.
	pub fn connect_request(id: String, nonce: Option<&str>, token: Option<&str>) -> Self {
		let mut params = json!({
			"minProtocol": GATEWAY_PROTOCOL,
			"maxProtocol": GATEWAY_PROTOCOL,
			"client": {
				"id": CLIENT_ID,
				"version": env!("CARGO_PKG_VERSION"),
				"platform": std::env::consts::OS,
				"mode": "webchat",
			},
			"role": "operator",
			"scopes": ["operator.read", "operator.write"],
			"caps": [],
			"commands": [],
		});
		if let Some(obj) = params.as_object_mut() {
			if let Some(nonce) = nonce {
				obj.insert("nonce".to_string(), json!(nonce));
			}
			if let Some(token) = token.filter(|t| !t.is_empty()) {
				obj.insert("auth".to_string(), json!({ "token": token }));
			}
		}
		GatewayFrame::Req {
			id,
			method: "connect".to_string(),
			params,
		}
	}

	/// Human-readable rejection detail of a failed [`GatewayFrame::Res`].
	pub fn rejection_detail(&self) -> Option<String> {
		match self {
			GatewayFrame::Res { ok: false, error, .. } => Some(match error {
				Some(Value::String(s)) => s.clone(),
				Some(Value::Object(obj)) => obj
					.get("message")
					.and_then(Value::as_str)
					.unwrap_or("gateway connect failed")
					.to_string(),
				_ => "gateway connect failed".to_string(),
			}),
			_ => None,
		}
	}
}
