// Fake Chromium debugging endpoint: `/json/version` plus a browser websocket
// answering the `Target`, `Storage` and page commands the bridge sends.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct FakePage {
	pub target_id: String,
	pub kind: String,
	pub url: String,
	pub title: String,
}

impl FakePage {
	pub fn page(target_id: &str, url: &str, title: &str) -> Self {
		Self {
			target_id: target_id.into(),
			kind: "page".into(),
			url: url.into(),
			title: title.into(),
		}
	}

	fn info(&self) -> Value {
		json!({
			"targetId": self.target_id,
			"type": self.kind,
			"url": self.url,
			"title": self.title,
			"attached": false,
		})
	}
}

/// A command the browser received.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
	pub session: Option<String>,
	pub method: String,
	pub params: Value,
}

#[derive(Default)]
struct BrowserState {
	pages: Vec<FakePage>,
	cookies: Vec<Value>,
	log: Vec<Received>,
	created: u32,
}

#[derive(Clone)]
pub struct FakeBrowser {
	state: Arc<Mutex<BrowserState>>,
	events: broadcast::Sender<String>,
	pub addr: SocketAddr,
}

impl FakeBrowser {
	pub async fn start(pages: Vec<FakePage>) -> Self {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let (events, _) = broadcast::channel(64);
		let browser = Self {
			state: Arc::new(Mutex::new(BrowserState {
				pages,
				..BrowserState::default()
			})),
			events,
			addr,
		};
		let app = Router::new()
			.route("/json/version", get(version))
			.route("/devtools/browser/fake", get(upgrade))
			.with_state(browser.clone());
		tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
		browser
	}

	pub fn port(&self) -> u16 {
		self.addr.port()
	}

	pub fn set_cookies(&self, cookies: Vec<Value>) {
		self.state.lock().cookies = cookies;
	}

	pub fn log(&self) -> Vec<Received> {
		self.state.lock().log.clone()
	}

	pub fn methods(&self) -> Vec<String> {
		self.log().into_iter().map(|r| r.method).collect()
	}

	/// Pushes an event to the bridge.
	pub fn emit(&self, session: Option<&str>, method: &str, params: Value) {
		let mut event = json!({ "method": method, "params": params });
		if let Some(session) = session {
			event["sessionId"] = json!(session);
		}
		let _ = self.events.send(event.to_string());
	}

	/// Closes a page the way the browser reports it.
	pub fn destroy(&self, target_id: &str) {
		self.state.lock().pages.retain(|p| p.target_id != target_id);
		self.emit(
			None,
			"Target.detachedFromTarget",
			json!({ "sessionId": session_for(target_id), "targetId": target_id }),
		);
		self.emit(None, "Target.targetDestroyed", json!({ "targetId": target_id }));
	}

	fn answer(&self, session: Option<&str>, method: &str, params: &Value) -> (Result<Value, String>, Vec<String>) {
		let mut state = self.state.lock();
		state.log.push(Received {
			session: session.map(str::to_string),
			method: method.to_string(),
			params: params.clone(),
		});
		let mut events = Vec::new();

		let reply = match (session, method) {
			(None, "Target.setDiscoverTargets") => Ok(json!({})),
			(None, "Target.getTargets") => Ok(json!({
				"targetInfos": state.pages.iter().map(FakePage::info).collect::<Vec<_>>()
			})),
			(None, "Target.attachToTarget") => {
				let target_id = params["targetId"].as_str().unwrap_or_default();
				if state.pages.iter().any(|p| p.target_id == target_id) {
					Ok(json!({ "sessionId": session_for(target_id) }))
				} else {
					Err("No target with given id found".to_string())
				}
			}
			(None, "Target.detachFromTarget") => Ok(json!({})),
			(None, "Target.createTarget") => {
				state.created += 1;
				let page = FakePage::page(
					&format!("NEW-{}", state.created),
					params["url"].as_str().unwrap_or("about:blank"),
					"",
				);
				events.push(json!({"method": "Target.targetCreated", "params": {"targetInfo": page.info()}}).to_string());
				let target_id = page.target_id.clone();
				state.pages.push(page);
				Ok(json!({ "targetId": target_id }))
			}
			(None, "Target.closeTarget" | "Target.activateTarget") => Ok(json!({})),
			(None, "Storage.getCookies") => Ok(json!({ "cookies": state.cookies })),
			(None, "Storage.setCookies") => Ok(json!({})),
			(Some(session), "Target.getTargetInfo") => {
				match state.pages.iter().find(|p| session_for(&p.target_id) == session) {
					Some(page) => {
						let mut info = page.info();
						info["attached"] = json!(true);
						Ok(json!({ "targetInfo": info }))
					}
					None => Err(format!("No session with given id found: {session}")),
				}
			}
			(Some(_), "Runtime.evaluate") => Ok(json!({ "result": { "type": "number", "value": 1 } })),
			(Some(_), _) => Ok(json!({})),
			(None, other) => Err(format!("'{other}' wasn't found")),
		};
		(reply, events)
	}
}

pub fn session_for(target_id: &str) -> String {
	format!("SESSION-{target_id}")
}

async fn version(State(browser): State<FakeBrowser>) -> impl IntoResponse {
	axum::Json(json!({
		"Browser": "FakeChrome/1.0",
		"webSocketDebuggerUrl": format!("ws://{}/devtools/browser/fake", browser.addr),
	}))
}

async fn upgrade(State(browser): State<FakeBrowser>, ws: WebSocketUpgrade) -> impl IntoResponse {
	ws.on_upgrade(move |socket| serve_socket(browser, socket))
}

async fn serve_socket(browser: FakeBrowser, mut socket: WebSocket) {
	let mut events = browser.events.subscribe();
	loop {
		tokio::select! {
			message = socket.recv() => {
				let Some(Ok(Message::Text(text))) = message else {
					return;
				};
				let request: Value = serde_json::from_str(text.as_str()).unwrap();
				let session = request.get("sessionId").and_then(Value::as_str);
				let method = request["method"].as_str().unwrap_or_default();
				let (reply, extra) = browser.answer(session, method, &request["params"]);
				let mut frame = match reply {
					Ok(result) => json!({ "id": request["id"], "result": result }),
					Err(message) => json!({ "id": request["id"], "error": { "code": -32000, "message": message } }),
				};
				if let Some(session) = session {
					frame["sessionId"] = json!(session);
				}
				for event in extra {
					if socket.send(Message::Text(event.into())).await.is_err() {
						return;
					}
				}
				if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
					return;
				}
			}
			Ok(event) = events.recv() => {
				if socket.send(Message::Text(event.into())).await.is_err() {
					return;
				}
			}
		}
	}
}

/// Polls `check` until it holds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
	for _ in 0..500 {
		if check() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("timed out waiting for {what}");
}
