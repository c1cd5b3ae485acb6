//! Probe pacing.
//!
//! Continuous-refill token bucket (GCRA) from `governor`: one permit is
//! replenished every `1s / pps`, with a small burst allowance so timer
//! granularity does not drag the effective rate below the target.
//!
//! The clock is a type parameter so tests can drive the pacer on a clock
//! they control.

use std::num::NonZeroU32;

use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use super::syn_sender::ScanError;

/// Burst allowance, as a fraction of the per-second rate (10 ms worth).
const BURST_DIVISOR: u32 = 100;

/// Admits at most `pps` probes per second, plus the burst allowance.
pub struct PacketPacer<C: Clock = DefaultClock> {
    limiter: RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<C::Instant>>,
    clock: C,
    packets_per_second: u32,
    burst: u32,
}

impl PacketPacer {
    /// Pacer on the system clock.
    pub fn new(packets_per_second: u32) -> Result<Self, ScanError> {
        Self::with_clock(packets_per_second, &DefaultClock::default())
    }
}

impl<C: Clock> PacketPacer<C> {
    /// Pacer on an explicit clock.
    pub fn with_clock(packets_per_second: u32, clock: &C) -> Result<Self, ScanError> {
        let rate = NonZeroU32::new(packets_per_second).ok_or_else(|| {
            ScanError::InvalidOptions("packets_per_second must be greater than zero".into())
        })?;
        let burst = NonZeroU32::new(packets_per_second / BURST_DIVISOR).unwrap_or(NonZeroU32::MIN);

        let quota = Quota::per_second(rate).allow_burst(burst);
        Ok(Self {
            limiter: RateLimiter::direct_with_clock(quota, clock),
            clock: clock.clone(),
            packets_per_second,
            burst: burst.get(),
        })
    }

    /// Wait for the next send permit.
    pub async fn take(&self) {
        while let Err(not_until) = self.limiter.check() {
            tokio::time::sleep(not_until.wait_time_from(self.clock.now())).await;
        }
    }

    /// Take a permit if one is available right now.
    pub fn try_take(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn packets_per_second(&self) -> u32 {
        self.packets_per_second
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }
}

/// Governor clock over tokio's clock, so a paused test runtime drives the
/// pacer.
#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct TokioClock {
    start: tokio::time::Instant,
}

#[cfg(test)]
impl TokioClock {
    pub(crate) fn new() -> Self {
        Self {
            start: tokio::time::Instant::now(),
        }
    }
}

#[cfg(test)]
impl Clock for TokioClock {
    type Instant = governor::nanos::Nanos;

    fn now(&self) -> Self::Instant {
        self.start.elapsed().into()
    }
}
