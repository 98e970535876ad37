//! Status board: per-target indicators plus a global summary, published on
//! a watch channel for whatever UI the host has.

use std::collections::BTreeMap;

use pw_bridge_protocol::LinkState;
use tokio::sync::watch;

use crate::platform::TargetId;

/// Per-target indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
	On,
	Off,
	/// Attached, but waiting for the control link or a reattach.
	Connecting,
}

/// Global summary shown next to the attached count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Summary {
	/// Link up with at least one attached target.
	Active,
	/// Link up, nothing attached.
	Idle,
	/// Link down.
	Offline,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
	pub phase: LinkState,
	pub attached: usize,
	/// Targets without an entry are [`Indicator::Off`].
	pub indicators: BTreeMap<TargetId, Indicator>,
}

impl StatusSnapshot {
	pub fn indicator(&self, target: TargetId) -> Indicator {
		self.indicators.get(&target).copied().unwrap_or(Indicator::Off)
	}

	pub fn summary(&self) -> Summary {
		match (self.phase, self.attached) {
			(LinkState::Connected, 0) => Summary::Idle,
			(LinkState::Connected, _) => Summary::Active,
			_ => Summary::Offline,
		}
	}
}

#[derive(Debug)]
pub(crate) struct StatusBoard {
	tx: watch::Sender<StatusSnapshot>,
}

impl StatusBoard {
	pub(crate) fn new() -> Self {
		let (tx, _) = watch::channel(StatusSnapshot::default());
		Self { tx }
	}

	pub(crate) fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
		self.tx.subscribe()
	}

	pub(crate) fn current(&self) -> StatusSnapshot {
		self.tx.borrow().clone()
	}

	pub(crate) fn set(&self, target: TargetId, indicator: Indicator) {
		self.tx.send_if_modified(|status| match indicator {
			Indicator::Off => status.indicators.remove(&target).is_some(),
			_ => status.indicators.insert(target, indicator) != Some(indicator),
		});
	}

	pub(crate) fn set_all(&self, targets: impl IntoIterator<Item = TargetId>, indicator: Indicator) {
		for target in targets {
			self.set(target, indicator);
		}
	}

	pub(crate) fn set_phase(&self, phase: LinkState) {
		self.tx.send_if_modified(|status| std::mem::replace(&mut status.phase, phase) != phase);
	}

	pub(crate) fn set_attached(&self, attached: usize) {
		self.tx
			.send_if_modified(|status| std::mem::replace(&mut status.attached, attached) != attached);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn summary_follows_phase_and_count() {
		let board = StatusBoard::new();
		assert_eq!(board.current().summary(), Summary::Offline);
		board.set_phase(LinkState::Connected);
		assert_eq!(board.current().summary(), Summary::Idle);
		board.set_attached(2);
		assert_eq!(board.current().summary(), Summary::Active);
	}

	#[test]
	fn off_removes_indicator() {
		let board = StatusBoard::new();
		board.set(TargetId(1), Indicator::On);
		board.set(TargetId(2), Indicator::Connecting);
		board.set(TargetId(1), Indicator::Off);
		let status = board.current();
		assert_eq!(status.indicator(TargetId(1)), Indicator::Off);
		assert_eq!(status.indicator(TargetId(2)), Indicator::Connecting);
		assert_eq!(status.indicators.len(), 1);
	}
}
