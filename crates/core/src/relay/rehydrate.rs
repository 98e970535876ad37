use pw_bridge_protocol::frame::methods;
use tracing::{debug, info};

use super::lifecycle::liveness_probe;
use super::{Indicator, Relay};
use crate::platform::TargetId;

impl Relay {
	/// Restores sessions from the snapshot store and drops those whose target
	/// is gone or unresponsive. Returns the number of sessions kept.
	pub(crate) async fn rehydrate(&self) -> usize {
		let snapshot = match self.inner.store.load().await {
			Ok(snapshot) => snapshot,
			Err(err) => {
				debug!(target = "pw.bridge", error = %err, "snapshot not loaded");
				None
			}
		};
		let Some(snapshot) = snapshot else {
			return 0;
		};

		let restored = self.inner.state.lock().table.restore(snapshot);
		let mut kept = 0usize;
		let mut pruned = 0usize;
		for target in restored {
			if self.is_alive(target).await {
				self.inner.status.set(target, Indicator::On);
				kept += 1;
			} else {
				self.inner.state.lock().table.remove(target);
				pruned += 1;
			}
		}

		info!(target = "pw.bridge", kept, pruned, "sessions rehydrated");
		if pruned > 0 {
			self.persist().await;
		} else {
			self.refresh_summary();
		}
		kept
	}

	async fn is_alive(&self, target: TargetId) -> bool {
		let platform = &self.inner.platform;
		match platform.get_target(target).await {
			Ok(Some(_)) => {}
			Ok(None) => return false,
			Err(err) => {
				debug!(target = "pw.bridge", target_id = %target, error = %err, "restored target lookup failed");
				return false;
			}
		}
		match platform
			.send_command(target, None, methods::RUNTIME_EVALUATE, Some(liveness_probe()))
			.await
		{
			Ok(_) => true,
			Err(err) => {
				debug!(target = "pw.bridge", target_id = %target, error = %err, "restored session unresponsive");
				false
			}
		}
	}
}
