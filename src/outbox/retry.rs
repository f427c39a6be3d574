use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with symmetric jitter and a retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
	/// Delay before the first retry.
	pub base_ms: u64,
	/// Upper bound on the un-jittered delay.
	pub cap_ms: u64,
	/// Jitter as a fraction of the delay (0.2 = ±20%).
	pub jitter: f64,
	/// Failed attempts after which an entry is given up on.
	pub max_retries: u32,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			base_ms: 2_000,
			cap_ms: 5 * 60 * 1_000,
			jitter: 0.2,
			max_retries: 8,
		}
	}
}

impl RetryPolicy {
	/// Un-jittered delay for the `attempt`-th failure (1-based).
	pub fn base_delay(&self, attempt: u32) -> Duration {
		let exp = attempt.saturating_sub(1).min(32);
		let ms = self.base_ms.saturating_mul(1u64 << exp).min(self.cap_ms);
		Duration::from_millis(ms)
	}

	/// Jittered delay for the `attempt`-th failure.
	pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
		let base = self.base_delay(attempt).as_millis() as f64;
		let jitter = self.jitter.clamp(0.0, 0.99);
		let factor = if jitter > 0.0 {
			rng.gen_range((1.0 - jitter)..=(1.0 + jitter))
		} else {
			1.0
		};
		Duration::from_millis((base * factor).round().max(1.0) as u64)
	}

	/// Whether `attempts` failures exhaust the budget.
	pub fn exhausted(&self, attempts: u32) -> bool {
		attempts >= self.max_retries
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use rand::SeedableRng;
	use rand::rngs::StdRng;

	use super::*;

	#[test]
	fn base_delay_doubles_until_cap() {
		let p = RetryPolicy::default();
		assert_eq!(p.base_delay(1), Duration::from_secs(2));
		assert_eq!(p.base_delay(2), Duration::from_secs(4));
		assert_eq!(p.base_delay(5), Duration::from_secs(32));
		assert_eq!(p.base_delay(9), Duration::from_secs(300));
		assert_eq!(p.base_delay(40), Duration::from_secs(300));
	}

	#[test]
	fn jitter_stays_within_twenty_percent() {
		let p = RetryPolicy::default();
		let mut rng = StdRng::seed_from_u64(7);
		for attempt in 1..=10 {
			let base = p.base_delay(attempt).as_millis() as f64;
			for _ in 0..50 {
				let d = p.delay(attempt, &mut rng).as_millis() as f64;
				assert!(d >= base * 0.8 - 1.0 && d <= base * 1.2 + 1.0, "{} vs {}", d, base);
			}
		}
	}

	#[test]
	fn budget_is_exhausted_at_max_retries() {
		let p = RetryPolicy {
			max_retries: 3,
			..RetryPolicy::default()
		};
		assert!(!p.exhausted(2));
		assert!(p.exhausted(3));
	}
}
