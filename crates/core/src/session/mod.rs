//! Session table: the bidirectional mapping between relay-visible session
//! ids and host targets.
//!
//! Both indices live in one owning structure and are only mutated through
//! its methods, so a lookup in either direction always agrees with the other.

use std::borrow::Borrow;
use std::collections::HashMap;

use pw_bridge_protocol::{PersistedState, SnapshotRecord};

use crate::platform::TargetId;

#[cfg(test)]
mod tests;

/// Prefix of every session id handed to the relay peer.
pub const SESSION_PREFIX: &str = "pw-tab-";

/// Relay-visible session id, `pw-tab-<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
	pub fn from_order(order: u64) -> Self {
		Self(format!("{SESSION_PREFIX}{order}"))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Sequence number encoded in the id, if it has the expected shape.
	pub fn order(&self) -> Option<u64> {
		self.0.strip_prefix(SESSION_PREFIX)?.parse().ok()
	}
}

impl Borrow<str> for SessionId {
	fn borrow(&self) -> &str {
		&self.0
	}
}

impl std::fmt::Display for SessionId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<String> for SessionId {
	fn from(id: String) -> Self {
		Self(id)
	}
}

impl From<&str> for SessionId {
	fn from(id: &str) -> Self {
		Self(id.to_string())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	/// Attached at the host, not yet usable for routing.
	Connecting,
	Connected,
}

/// One attached target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
	pub session_id: SessionId,
	pub target: TargetId,
	/// Target-protocol `targetId` of the target.
	pub protocol_target_id: String,
	pub attach_order: u64,
	/// Unix millis; `0` for rehydrated sessions.
	pub attached_at_ms: u64,
	pub url: String,
	pub title: String,
	pub state: SessionState,
}

impl Session {
	pub fn is_connected(&self) -> bool {
		self.state == SessionState::Connected
	}
}

/// Where a session id points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
	pub target: TargetId,
	/// Set when the id named a child session of `target`.
	pub child_session: Option<String>,
}

/// Entries dropped by [`SessionTable::remove`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
	pub session: Session,
	pub children: Vec<String>,
}

#[derive(Debug)]
pub struct SessionTable {
	sessions: HashMap<TargetId, Session>,
	by_session: HashMap<SessionId, TargetId>,
	/// Child session id to owning target.
	children: HashMap<String, TargetId>,
	next_session: u64,
}

impl Default for SessionTable {
	fn default() -> Self {
		Self::new()
	}
}

impl SessionTable {
	pub fn new() -> Self {
		Self {
			sessions: HashMap::new(),
			by_session: HashMap::new(),
			children: HashMap::new(),
			next_session: 1,
		}
	}

	pub fn len(&self) -> usize {
		self.sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.is_empty()
	}

	/// Next sequence number [`allocate`](Self::allocate) will hand out.
	pub fn next_session(&self) -> u64 {
		self.next_session
	}

	/// Reserves a fresh session id. Ids are never reused.
	pub fn allocate(&mut self) -> (SessionId, u64) {
		let order = self.next_session;
		self.next_session += 1;
		(SessionId::from_order(order), order)
	}

	/// Inserts or replaces the session of `session.target`.
	///
	/// A previous session of the same target is dropped together with its
	/// children, as is any other target claiming the same session id.
	pub fn put(&mut self, session: Session) {
		if let Some(owner) = self.by_session.get(&session.session_id).copied() {
			if owner != session.target {
				self.remove(owner);
			}
		}
		if let Some(previous) = self.sessions.get(&session.target) {
			if previous.session_id != session.session_id {
				let stale = previous.session_id.clone();
				self.by_session.remove(&stale);
			}
		}
		self.next_session = self.next_session.max(session.attach_order + 1);
		self.by_session.insert(session.session_id.clone(), session.target);
		self.sessions.insert(session.target, session);
		debug_assert!(self.is_consistent());
	}

	pub fn get(&self, target: TargetId) -> Option<&Session> {
		self.sessions.get(&target)
	}

	pub fn contains(&self, target: TargetId) -> bool {
		self.sessions.contains_key(&target)
	}

	pub fn get_by_session(&self, session_id: &str) -> Option<&Session> {
		self.by_session
			.get(session_id)
			.and_then(|target| self.sessions.get(target))
	}

	/// Resolves a main or child session id.
	pub fn resolve_session(&self, session_id: &str) -> Option<Resolved> {
		if let Some(target) = self.by_session.get(session_id) {
			return Some(Resolved {
				target: *target,
				child_session: None,
			});
		}
		self.children.get(session_id).map(|target| Resolved {
			target: *target,
			child_session: Some(session_id.to_string()),
		})
	}

	/// Target whose target-protocol `targetId` is `protocol_id`.
	pub fn find_by_protocol_id(&self, protocol_id: &str) -> Option<TargetId> {
		self.sessions
			.values()
			.find(|s| s.protocol_target_id == protocol_id)
			.map(|s| s.target)
	}

	/// Removes the session of `target`, both index entries and all children,
	/// in one step.
	pub fn remove(&mut self, target: TargetId) -> Option<Removed> {
		let session = self.sessions.remove(&target)?;
		self.by_session.remove(&session.session_id);
		let mut children: Vec<String> = self
			.children
			.iter()
			.filter(|(_, owner)| **owner == target)
			.map(|(child, _)| child.clone())
			.collect();
		children.sort();
		for child in &children {
			self.children.remove(child);
		}
		debug_assert!(self.is_consistent());
		Some(Removed { session, children })
	}

	/// Records a child session of an attached target. Ignored for unknown targets.
	pub fn add_child(&mut self, target: TargetId, child_session: impl Into<String>) -> bool {
		if !self.sessions.contains_key(&target) {
			return false;
		}
		self.children.insert(child_session.into(), target);
		true
	}

	pub fn remove_child(&mut self, child_session: &str) -> Option<TargetId> {
		self.children.remove(child_session)
	}

	pub fn children_of(&self, target: TargetId) -> Vec<String> {
		let mut children: Vec<String> = self
			.children
			.iter()
			.filter(|(_, owner)| **owner == target)
			.map(|(child, _)| child.clone())
			.collect();
		children.sort();
		children
	}

	/// Moves the session (and its children) of `removed` onto `added`.
	pub fn rekey(&mut self, removed: TargetId, added: TargetId) -> bool {
		if removed == added || self.sessions.contains_key(&added) {
			return false;
		}
		let Some(mut session) = self.sessions.remove(&removed) else {
			return false;
		};
		session.target = added;
		self.by_session.insert(session.session_id.clone(), added);
		for owner in self.children.values_mut() {
			if *owner == removed {
				*owner = added;
			}
		}
		self.sessions.insert(added, session);
		debug_assert!(self.is_consistent());
		true
	}

	/// Connecting to Connected. Returns false if the session was not connecting.
	pub fn mark_connected(&mut self, target: TargetId) -> bool {
		match self.sessions.get_mut(&target) {
			Some(session) if session.state == SessionState::Connecting => {
				session.state = SessionState::Connected;
				true
			}
			_ => false,
		}
	}

	pub fn update_metadata(&mut self, target: TargetId, url: Option<&str>, title: Option<&str>) -> bool {
		let Some(session) = self.sessions.get_mut(&target) else {
			return false;
		};
		if let Some(url) = url {
			session.url = url.to_string();
		}
		if let Some(title) = title {
			session.title = title.to_string();
		}
		true
	}

	/// Connected sessions ordered by attach order.
	pub fn list_connected(&self) -> Vec<&Session> {
		let mut sessions: Vec<&Session> = self.sessions.values().filter(|s| s.is_connected()).collect();
		sessions.sort_by_key(|s| s.attach_order);
		sessions
	}

	/// Oldest connected session.
	pub fn first_connected(&self) -> Option<&Session> {
		self.sessions
			.values()
			.filter(|s| s.is_connected())
			.min_by_key(|s| s.attach_order)
	}

	/// Durable view: connected sessions plus the id counter.
	pub fn snapshot(&self) -> PersistedState {
		PersistedState {
			persisted_tabs: self
				.list_connected()
				.into_iter()
				.map(|s| SnapshotRecord {
					tab_id: s.target.0,
					session_id: s.session_id.to_string(),
					target_id: s.protocol_target_id.clone(),
					attach_order: s.attach_order,
				})
				.collect(),
			next_session: self.next_session,
		}
	}

	/// Repopulates the table from a snapshot, optimistically as Connected.
	///
	/// Returns the restored targets in attach order. Records for targets that
	/// are already tracked, or that reuse a tracked session id, are skipped.
	pub fn restore(&mut self, state: PersistedState) -> Vec<TargetId> {
		let mut restored = Vec::new();
		let mut highest = 0u64;
		let mut records = state.persisted_tabs;
		records.sort_by_key(|r| r.attach_order);

		for record in records {
			let session_id = SessionId::from(record.session_id);
			let attach_order = match record.attach_order {
				0 => session_id.order().unwrap_or(0),
				order => order,
			};
			highest = highest.max(attach_order);

			let target = TargetId(record.tab_id);
			if self.sessions.contains_key(&target) || self.by_session.contains_key(&session_id) {
				continue;
			}
			self.by_session.insert(session_id.clone(), target);
			self.sessions.insert(
				target,
				Session {
					session_id,
					target,
					protocol_target_id: record.target_id,
					attach_order,
					attached_at_ms: 0,
					url: String::new(),
					title: String::new(),
					state: SessionState::Connected,
				},
			);
			restored.push(target);
		}

		self.next_session = self
			.next_session
			.max(state.next_session)
			.max(highest.saturating_add(1));
		debug_assert!(self.is_consistent());
		restored
	}

	/// Both indices agree and every child belongs to a tracked target.
	pub fn is_consistent(&self) -> bool {
		self.sessions.len() == self.by_session.len()
			&& self.sessions.iter().all(|(target, session)| {
				session.target == *target
					&& self.by_session.get(&session.session_id) == Some(target)
			})
			&& self.children.values().all(|owner| self.sessions.contains_key(owner))
	}
}
