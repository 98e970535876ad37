//! Reconnect backoff.

use std::time::Duration;

use rand::Rng;

/// Largest exponent applied to `base`; keeps the shift far from overflow.
const MAX_EXPONENT: u32 = 16;

/// Exponential backoff with additive jitter.
///
/// `delay(n) = min(base * 2^n, max) + uniform(0..=jitter)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
	pub base: Duration,
	pub max: Duration,
	pub jitter: Duration,
}

impl Default for BackoffPolicy {
	fn default() -> Self {
		Self {
			base: Duration::from_millis(1000),
			max: Duration::from_millis(30_000),
			jitter: Duration::from_millis(1000),
		}
	}
}

impl BackoffPolicy {
	/// Deterministic part of the delay for `attempt` (0-based).
	pub fn floor(&self, attempt: u32) -> Duration {
		let factor = 1u32 << attempt.min(MAX_EXPONENT);
		self.base.saturating_mul(factor).min(self.max)
	}

	/// Delay before reconnect attempt `attempt`, jitter included.
	pub fn delay(&self, attempt: u32) -> Duration {
		let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
		let jitter = if jitter_ms == 0 {
			0
		} else {
			rand::rng().random_range(0..=jitter_ms)
		};
		self.floor(attempt).saturating_add(Duration::from_millis(jitter))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn floor_doubles_until_capped() {
		let policy = BackoffPolicy::default();
		assert_eq!(policy.floor(0), Duration::from_secs(1));
		assert_eq!(policy.floor(1), Duration::from_secs(2));
		assert_eq!(policy.floor(4), Duration::from_secs(16));
		assert_eq!(policy.floor(5), Duration::from_secs(30));
		assert_eq!(policy.floor(u32::MAX), Duration::from_secs(30));
	}

	#[test]
	fn delay_stays_within_envelope() {
		let policy = BackoffPolicy::default();
		for attempt in [0, 1, 2, 3, 7, 40, u32::MAX] {
			for _ in 0..50 {
				let delay = policy.delay(attempt);
				let floor = policy.floor(attempt);
				assert!(delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
				assert!(delay <= floor + policy.jitter);
				assert!(delay <= Duration::from_secs(31));
			}
		}
	}

	#[test]
	fn zero_jitter_is_deterministic() {
		let policy = BackoffPolicy {
			jitter: Duration::ZERO,
			..BackoffPolicy::default()
		};
		assert_eq!(policy.delay(2), Duration::from_secs(4));
	}
}
