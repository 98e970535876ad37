//! Envelope frames exchanged with the relay peer.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::gateway::GatewayFrame;

/// Method names used on the control connection and inside forwarded frames.
pub mod methods {
	pub const FORWARD_CDP_COMMAND: &str = "forwardCDPCommand";
	pub const FORWARD_CDP_EVENT: &str = "forwardCDPEvent";
	pub const PING: &str = "ping";
	pub const PONG: &str = "pong";

	pub const TARGET_ATTACHED: &str = "Target.attachedToTarget";
	pub const TARGET_DETACHED: &str = "Target.detachedFromTarget";
	pub const TARGET_GET_INFO: &str = "Target.getTargetInfo";
	pub const TARGET_CREATE: &str = "Target.createTarget";
	pub const TARGET_CLOSE: &str = "Target.closeTarget";
	pub const TARGET_ACTIVATE: &str = "Target.activateTarget";

	pub const PAGE_ENABLE: &str = "Page.enable";
	pub const RUNTIME_ENABLE: &str = "Runtime.enable";
	pub const RUNTIME_DISABLE: &str = "Runtime.disable";
	pub const RUNTIME_EVALUATE: &str = "Runtime.evaluate";

	pub const TAB_LIST: &str = "Tab.list";
	pub const TAB_ATTACH_ALL: &str = "Tab.attachAll";
	pub const TAB_GET_STATUS: &str = "Tab.getStatus";
}

/// Detach reasons the bridge reports in `Target.detachedFromTarget`.
pub mod reasons {
	pub const NAVIGATION_REATTACH: &str = "navigation-reattach";
	pub const PARENT_DETACHED: &str = "parent_detached";
	pub const TAB_CLOSED: &str = "tab_closed";
}

/// Target-protocol command forwarded by the peer inside `forwardCDPCommand`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardCommand {
	/// Target-protocol method, e.g. `Runtime.evaluate`.
	#[serde(default)]
	pub method: String,
	/// Method parameters, passed through untouched.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub params: Option<Value>,
	/// Session the command is addressed to (top-level or child).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
}

impl ForwardCommand {
	pub fn new(method: impl Into<String>) -> Self {
		Self {
			method: method.into(),
			params: None,
			session_id: None,
		}
	}

	pub fn with_params(mut self, params: Value) -> Self {
		self.params = Some(params);
		self
	}

	pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
		self.session_id = Some(session_id.into());
		self
	}

	/// `targetId` embedded in the command parameters, if any.
	pub fn inner_target_id(&self) -> Option<&str> {
		self.params
			.as_ref()
			.and_then(|p| p.get("targetId"))
			.and_then(Value::as_str)
			.filter(|s| !s.is_empty())
	}

	/// String parameter lookup, ignoring values of other types.
	pub fn str_param(&self, key: &str) -> Option<&str> {
		self.params.as_ref().and_then(|p| p.get(key)).and_then(Value::as_str)
	}
}

/// Target-protocol event forwarded to the peer inside `forwardCDPEvent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardEvent {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
	pub method: String,
	#[serde(default)]
	pub params: Value,
}

impl ForwardEvent {
	/// Announces an attached session to the peer.
	///
	/// `target_info` is the target-protocol `TargetInfo` object; it is forced to
	/// report `attached: true`.
	pub fn attached(session_id: &str, target_info: Value) -> Self {
		let mut info = match target_info {
			Value::Object(map) => Value::Object(map),
			_ => json!({}),
		};
		if let Some(obj) = info.as_object_mut() {
			obj.insert("attached".to_string(), Value::Bool(true));
		}
		Self {
			session_id: None,
			method: methods::TARGET_ATTACHED.to_string(),
			params: json!({
				"sessionId": session_id,
				"targetInfo": info,
				"waitingForDebugger": false,
			}),
		}
	}

	/// Tells the peer a session is gone.
	pub fn detached(session_id: &str, target_id: Option<&str>, reason: &str) -> Self {
		let params = match target_id {
			Some(target_id) => json!({
				"sessionId": session_id,
				"targetId": target_id,
				"reason": reason,
			}),
			None => json!({ "sessionId": session_id, "reason": reason }),
		};
		Self {
			session_id: None,
			method: methods::TARGET_DETACHED.to_string(),
			params,
		}
	}

	/// Wraps the event in its `forwardCDPEvent` notification envelope.
	pub fn into_frame(self) -> Value {
		notification(methods::FORWARD_CDP_EVENT, Some(json!(self)))
	}
}

/// A frame received from the peer, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
	/// Keepalive ping, answered with a pong notification.
	Ping,
	/// Reply to a request the bridge sent.
	Response {
		id: u64,
		outcome: Result<Value, String>,
	},
	/// Command the bridge must execute and answer.
	Command { id: u64, command: ForwardCommand },
	/// Command with a usable id but an unusable body.
	Malformed { id: u64, reason: String },
	/// Gateway handshake frame.
	Gateway(GatewayFrame),
	/// Anything else; logged and dropped.
	Other(Value),
}

impl Inbound {
	/// Classifies a parsed JSON frame.
	///
	/// Order matters: gateway frames are recognized by their `type` tag, then
	/// pings, then replies (numeric id plus `result`/`error`), then commands.
	pub fn classify(value: Value) -> Self {
		if matches!(
			value.get("type").and_then(Value::as_str),
			Some("event" | "req" | "res")
		) {
			if let Ok(frame) = serde_json::from_value::<GatewayFrame>(value.clone()) {
				return Inbound::Gateway(frame);
			}
		}

		let method = value.get("method").and_then(Value::as_str);
		if method == Some(methods::PING) {
			return Inbound::Ping;
		}

		let Some(id) = value.get("id").and_then(Value::as_u64) else {
			return Inbound::Other(value);
		};

		let has_result = value.get("result").is_some();
		let error = value.get("error").filter(|e| !e.is_null());
		if has_result || error.is_some() {
			let outcome = match error {
				Some(err) => Err(error_message(err)),
				None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
			};
			return Inbound::Response { id, outcome };
		}

		if method == Some(methods::FORWARD_CDP_COMMAND) {
			let params = value.get("params").cloned().unwrap_or(Value::Null);
			return match serde_json::from_value::<ForwardCommand>(params) {
				Ok(command) if !command.method.trim().is_empty() => Inbound::Command { id, command },
				Ok(_) => Inbound::Malformed {
					id,
					reason: "forwardCDPCommand missing method".to_string(),
				},
				Err(err) => Inbound::Malformed {
					id,
					reason: format!("invalid forwardCDPCommand params: {err}"),
				},
			};
		}

		Inbound::Other(value)
	}
}

fn error_message(err: &Value) -> String {
	match err {
		Value::String(s) => s.clone(),
		Value::Object(obj) => obj
			.get("message")
			.and_then(Value::as_str)
			.map(str::to_owned)
			.unwrap_or_else(|| err.to_string()),
		other => other.to_string(),
	}
}

/// `{id, method, params}`
pub fn request(id: u64, method: &str, params: Option<Value>) -> Value {
	match params {
		Some(params) => json!({ "id": id, "method": method, "params": params }),
		None => json!({ "id": id, "method": method }),
	}
}

/// `{id, result}`
pub fn response_ok(id: u64, result: Value) -> Value {
	json!({ "id": id, "result": result })
}

/// `{id, error}`
pub fn response_err(id: u64, message: &str) -> Value {
	json!({ "id": id, "error": message })
}

/// `{method, params}`
pub fn notification(method: &str, params: Option<Value>) -> Value {
	match params {
		Some(params) => json!({ "method": method, "params": params }),
		None => json!({ "method": method }),
	}
}
