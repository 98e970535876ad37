//! Bookkeeping between browser target ids, host ids and flattened sessions.
//!
//! [`TargetIndex::on_event`] turns raw browser events into
//! [`PlatformEvent`]s; it is synchronous so the translation can be tested
//! without a browser.

use std::collections::{BTreeMap, HashMap};

use pw_bridge::{DetachReason, PlatformEvent, TargetId, TargetInfo};
use serde::Deserialize;
use serde_json::Value;

use super::connection::CdpEvent;

/// `TargetInfo` object of the browser's `Target` domain.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdpTargetInfo {
	pub target_id: String,
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub url: String,
	#[serde(default)]
	pub title: String,
}

impl CdpTargetInfo {
	pub fn page(target_id: &str, url: &str) -> Self {
		Self {
			target_id: target_id.to_string(),
			kind: "page".to_string(),
			url: url.to_string(),
			title: String::new(),
		}
	}

	pub fn is_page(&self) -> bool {
		self.kind == "page"
	}
}

#[derive(Debug, Clone)]
struct Page {
	cdp_id: String,
	url: String,
	title: String,
}

#[derive(Debug)]
pub struct TargetIndex {
	next_id: u64,
	pages: BTreeMap<TargetId, Page>,
	by_cdp: HashMap<String, TargetId>,
	sessions: HashMap<TargetId, String>,
	session_owner: HashMap<String, TargetId>,
	/// Child session id to the page it belongs to.
	children: HashMap<String, TargetId>,
}

impl Default for TargetIndex {
	fn default() -> Self {
		Self {
			next_id: 1,
			pages: BTreeMap::new(),
			by_cdp: HashMap::new(),
			sessions: HashMap::new(),
			session_owner: HashMap::new(),
			children: HashMap::new(),
		}
	}
}

impl TargetIndex {
	pub fn len(&self) -> usize {
		self.pages.len()
	}

	pub fn is_empty(&self) -> bool {
		self.pages.is_empty()
	}

	/// Host id for `info`, allocating one for unseen targets. The flag is
	/// true when the target was new.
	pub fn register(&mut self, info: &CdpTargetInfo) -> (TargetId, bool) {
		if let Some(&id) = self.by_cdp.get(&info.target_id) {
			return (id, false);
		}
		let id = TargetId(self.next_id);
		self.next_id += 1;
		self.by_cdp.insert(info.target_id.clone(), id);
		self.pages.insert(
			id,
			Page {
				cdp_id: info.target_id.clone(),
				url: info.url.clone(),
				title: info.title.clone(),
			},
		);
		(id, true)
	}

	pub fn cdp_id(&self, target: TargetId) -> Option<&str> {
		self.pages.get(&target).map(|p| p.cdp_id.as_str())
	}

	pub fn get(&self, target: TargetId) -> Option<TargetInfo> {
		self.pages.get(&target).map(|page| TargetInfo {
			id: target,
			url: page.url.clone(),
			title: page.title.clone(),
		})
	}

	pub fn list(&self) -> Vec<TargetInfo> {
		self.pages.keys().filter_map(|&id| self.get(id)).collect()
	}

	pub fn session(&self, target: TargetId) -> Option<&str> {
		self.sessions.get(&target).map(String::as_str)
	}

	pub fn bind_session(&mut self, target: TargetId, session: &str) {
		if let Some(previous) = self.sessions.insert(target, session.to_string()) {
			self.session_owner.remove(&previous);
		}
		self.session_owner.insert(session.to_string(), target);
	}

	/// Forgets the main session of `target` and the children under it, so
	/// the browser's detach notification for it is not reported.
	pub fn unbind_session(&mut self, target: TargetId) -> Option<String> {
		let session = self.sessions.remove(&target)?;
		self.session_owner.remove(&session);
		self.children.retain(|_, owner| *owner != target);
		Some(session)
	}

	fn forget(&mut self, target: TargetId) {
		self.unbind_session(target);
		if let Some(page) = self.pages.remove(&target) {
			self.by_cdp.remove(&page.cdp_id);
		}
	}

	pub fn on_event(&mut self, event: CdpEvent) -> Vec<PlatformEvent> {
		match event.session_id {
			Some(session) => self.on_session_event(session, event.method, event.params),
			None => self.on_browser_event(&event.method, &event.params),
		}
	}

	fn on_session_event(&mut self, session: String, method: String, params: Value) -> Vec<PlatformEvent> {
		let (target, child_session) = if let Some(&owner) = self.session_owner.get(&session) {
			(owner, None)
		} else if let Some(&owner) = self.children.get(&session) {
			(owner, Some(session))
		} else {
			return Vec::new();
		};

		let nested = params.get("sessionId").and_then(Value::as_str);
		match (method.as_str(), nested) {
			("Target.attachedToTarget", Some(child)) => {
				self.children.insert(child.to_string(), target);
			}
			("Target.detachedFromTarget", Some(child)) => {
				self.children.remove(child);
			}
			_ => {}
		}

		vec![PlatformEvent::Protocol {
			target,
			child_session,
			method,
			params,
		}]
	}

	fn on_browser_event(&mut self, method: &str, params: &Value) -> Vec<PlatformEvent> {
		let info = || {
			params
				.get("targetInfo")
				.cloned()
				.and_then(|v| serde_json::from_value::<CdpTargetInfo>(v).ok())
		};

		match method {
			"Target.targetCreated" => {
				let Some(info) = info().filter(CdpTargetInfo::is_page) else {
					return Vec::new();
				};
				match self.register(&info) {
					(id, true) => vec![PlatformEvent::Created(TargetInfo {
						id,
						url: info.url,
						title: info.title,
					})],
					_ => Vec::new(),
				}
			}
			"Target.targetInfoChanged" => {
				let Some(info) = info().filter(CdpTargetInfo::is_page) else {
					return Vec::new();
				};
				let (id, created) = self.register(&info);
				if created {
					return vec![PlatformEvent::Created(TargetInfo {
						id,
						url: info.url,
						title: info.title,
					})];
				}
				let Some(page) = self.pages.get_mut(&id) else {
					return Vec::new();
				};
				let loading = page.url != info.url;
				if !loading && page.title == info.title {
					return Vec::new();
				}
				page.url = info.url.clone();
				page.title = info.title.clone();
				vec![PlatformEvent::Updated {
					target: id,
					url: Some(info.url),
					title: Some(info.title),
					loading,
				}]
			}
			"Target.targetDestroyed" => {
				let Some(&id) = params
					.get("targetId")
					.and_then(Value::as_str)
					.and_then(|cdp| self.by_cdp.get(cdp))
				else {
					return Vec::new();
				};
				self.forget(id);
				vec![PlatformEvent::Removed(id)]
			}
			"Target.attachedToTarget" => {
				// Reported for our own flattened attaches; binds the session
				// before the command reply arrives.
				let session = params.get("sessionId").and_then(Value::as_str);
				let target = info().and_then(|info| self.by_cdp.get(&info.target_id).copied());
				if let (Some(session), Some(target)) = (session, target) {
					if !self.sessions.contains_key(&target) {
						self.bind_session(target, session);
					}
				}
				Vec::new()
			}
			"Target.detachedFromTarget" => {
				let Some(&target) = params
					.get("sessionId")
					.and_then(Value::as_str)
					.and_then(|session| self.session_owner.get(session))
				else {
					return Vec::new();
				};
				self.unbind_session(target);
				vec![PlatformEvent::Detached {
					target,
					reason: DetachReason::Other("session_detached".to_string()),
				}]
			}
			"Target.targetCrashed" => {
				let target = params
					.get("targetId")
					.and_then(Value::as_str)
					.and_then(|cdp| self.by_cdp.get(cdp).copied());
				match target {
					Some(target) if self.sessions.contains_key(&target) => {
						self.unbind_session(target);
						vec![PlatformEvent::Detached {
							target,
							reason: DetachReason::Other("target_crashed".to_string()),
						}]
					}
					_ => Vec::new(),
				}
			}
			_ => Vec::new(),
		}
	}
}
