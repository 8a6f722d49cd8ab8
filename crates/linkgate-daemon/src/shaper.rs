//! Timing-safety shaper.
//!
//! Pads every gate response so its total duration lands near
//! `envelope.target`, independent of which outcome was reached. The padding is
//! `max(0, target - elapsed)`; the per-call target carries bell-shaped jitter
//! (mean of four uniform samples in `[-1, 1]`) of at most `envelope.jitter`.
//! A response that already overran its target is returned without delay.
//!
//! Padding never runs past the invocation's overall deadline and stops early
//! if the invocation is cancelled.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use linkgate_core::{ConsistencyOutcome, EnvelopeConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::trace;

use crate::cancel::CancelToken;

/// Number of uniform samples averaged per jitter draw.
const JITTER_SAMPLES: u32 = 4;

#[derive(Debug)]
enum JitterSource {
    /// Per-thread generator; nothing shared between invocations.
    ThreadLocal,
    /// Deterministic sequence for reproducible runs.
    Seeded(Mutex<StdRng>),
}

/// Pads responses to the configured envelope.
#[derive(Debug)]
pub struct TimingShaper {
    envelope: EnvelopeConfig,
    jitter: JitterSource,
}

impl TimingShaper {
    /// Creates a shaper drawing jitter from the thread-local generator.
    #[must_use]
    pub const fn new(envelope: EnvelopeConfig) -> Self {
        Self {
            envelope,
            jitter: JitterSource::ThreadLocal,
        }
    }

    /// Creates a shaper with deterministic jitter.
    #[must_use]
    pub fn with_seed(envelope: EnvelopeConfig, seed: u64) -> Self {
        Self {
            envelope,
            jitter: JitterSource::Seeded(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Configured envelope.
    #[must_use]
    pub const fn envelope(&self) -> EnvelopeConfig {
        self.envelope
    }

    /// Draws the target duration for one response.
    ///
    /// Always within `target ± jitter`.
    #[must_use]
    pub fn sample_target(&self) -> Duration {
        if self.envelope.jitter.is_zero() {
            return self.envelope.target;
        }
        let spread = match &self.jitter {
            JitterSource::ThreadLocal => spread(&mut rand::thread_rng()),
            JitterSource::Seeded(rng) => {
                spread(&mut *rng.lock().unwrap_or_else(PoisonError::into_inner))
            },
        };
        let target =
            self.envelope.target.as_secs_f64() + self.envelope.jitter.as_secs_f64() * spread;
        Duration::from_secs_f64(target.max(0.0))
    }

    /// Sleeps until the response reaches its sampled target.
    ///
    /// `elapsed` is the time already spent in the invocation and `deadline`
    /// its overall deadline; padding is capped at the time left before it. The
    /// outcome only feeds the trace record; every outcome is padded the same
    /// way. Returns the padding actually applied, which is shorter than planned
    /// when `cancel` fires.
    pub async fn normalize(
        &self,
        elapsed: Duration,
        outcome: ConsistencyOutcome,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Duration {
        let target = self.sample_target();
        let now = Instant::now();
        let padding = target
            .saturating_sub(elapsed)
            .min(deadline.saturating_duration_since(now));
        trace!(
            outcome = outcome.as_str(),
            elapsed = ?elapsed,
            padding = ?padding,
            "shaping gate response"
        );
        if padding.is_zero() {
            return padding;
        }
        tokio::select! {
            () = tokio::time::sleep(padding) => padding,
            () = cancel.cancelled() => now.elapsed(),
        }
    }
}

/// Mean of [`JITTER_SAMPLES`] uniform draws in `[-1, 1]`.
fn spread<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    (0..JITTER_SAMPLES)
        .map(|_| rng.gen_range(-1.0_f64..=1.0))
        .sum::<f64>()
        / f64::from(JITTER_SAMPLES)
}
