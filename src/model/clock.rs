use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock milliseconds. Injected so tests can drive time.
pub trait Clock: Send + Sync {
	fn now_millis(&self) -> u64;
}

/// Clock backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now_millis(&self) -> u64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_millis() as u64)
			.unwrap_or(0)
	}
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
	now: Arc<AtomicU64>,
}

impl ManualClock {
	pub fn new(start_millis: u64) -> Self {
		Self {
			now: Arc::new(AtomicU64::new(start_millis)),
		}
	}

	pub fn set(&self, millis: u64) {
		self.now.store(millis, Ordering::SeqCst);
	}

	pub fn advance(&self, by: Duration) {
		self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
	}
}

impl Clock for ManualClock {
	fn now_millis(&self) -> u64 {
		self.now.load(Ordering::SeqCst)
	}
}

/// Monotone logical timestamp source layered over a wall clock.
///
/// Never hands out the same value twice and never goes backwards, even if the
/// underlying clock does.
pub struct LogicalClock {
	clock: Arc<dyn Clock>,
	last: u64,
}

impl LogicalClock {
	pub fn new(clock: Arc<dyn Clock>) -> Self {
		Self { clock, last: 0 }
	}

	/// Resume after a restart so timestamps stay above everything persisted.
	pub fn observe(&mut self, seen: u64) {
		self.last = self.last.max(seen);
	}

	pub fn tick(&mut self) -> u64 {
		let now = self.clock.now_millis();
		self.last = now.max(self.last + 1);
		self.last
	}

	/// Wall-clock reading without advancing the logical counter.
	pub fn wall(&self) -> u64 {
		self.clock.now_millis()
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn logical_clock_is_strictly_increasing_when_wall_clock_stalls() {
		let manual = ManualClock::new(1_000);
		let mut clock = LogicalClock::new(Arc::new(manual.clone()));
		let a = clock.tick();
		let b = clock.tick();
		assert_eq!(a, 1_000);
		assert_eq!(b, 1_001);

		manual.set(500);
		assert!(clock.tick() > b);
	}

	#[test]
	fn observe_lifts_the_floor() {
		let mut clock = LogicalClock::new(Arc::new(ManualClock::new(10)));
		clock.observe(5_000);
		assert_eq!(clock.tick(), 5_001);
	}
}
