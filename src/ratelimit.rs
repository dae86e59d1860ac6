use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Leaky-bucket rate limiter.
///
/// Each `take` reserves the next free slot on a timeline spaced
/// `1/rate` apart and sleeps until that slot arrives. The reservation is
/// made under a plain mutex so concurrent workers sharing one limiter
/// queue up fairly; the sleep happens outside the lock.
#[derive(Debug)]
pub struct RateLimiter {
	interval: Duration,
	next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
	/// Limiter allowing `rate` takes per second.
	pub fn new(rate: u32) -> Self {
		assert!(rate > 0, "rate limiter requires a positive rate");
		RateLimiter {
			interval: Duration::from_secs(1) / rate,
			next_slot: Mutex::new(None),
		}
	}

	/// Block until the next slot is free.
	pub async fn take(&self) {
		let slot = self.reserve();
		tokio::time::sleep_until(slot).await;
	}

	/// Block until the next slot is free, or until `token` is cancelled.
	///
	/// Returns false when cancellation won the race; the caller must not
	/// issue the query it was pacing.
	pub async fn take_until(&self, token: &CancellationToken) -> bool {
		let slot = self.reserve();
		tokio::select! {
			_ = tokio::time::sleep_until(slot) => true,
			_ = token.cancelled() => false,
		}
	}

	fn reserve(&self) -> Instant {
		let mut next = self.next_slot.lock().expect("rate limiter mutex poisoned");
		let now = Instant::now();
		let slot = match *next {
			Some(at) if at > now => at,
			_ => now,
		};
		*next = Some(slot + self.interval);
		slot
	}
}
