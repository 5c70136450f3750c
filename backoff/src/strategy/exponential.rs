use std::time::Duration;

use rand::Rng;

/// An exponential backoff strategy where every pause is `factor` times the previous
/// one, capped at `cap`, with optional jitter applied.
///
/// The iterator never ends on its own; bound the number of retries with `take`.
///
/// # Example
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// // 100ms, 200ms, 400ms, 800ms, 1s, 1s, ... without jitter
/// let mut backoff = Exponential::from_millis(100, 1000, 2.0, 0.0);
/// assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
/// assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    /// The pause to hand out next, before jitter.
    current: Duration,
    /// The maximum pause (cap).
    cap: Duration,
    /// The multiplier applied after each pause.
    factor: f64,
    /// Jitter value between 0.0 and 1.0 for randomization. A jitter of `j` scales
    /// each pause by a random factor in `[1 - j, 1 + j]`.
    jitter: f64,
}

impl Exponential {
    pub fn new(base: Duration, cap: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            current: base,
            cap,
            factor,
            jitter,
        }
    }

    pub fn from_millis(base_ms: u64, cap_ms: u64, factor: f64, jitter: f64) -> Self {
        Self::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(cap_ms),
            factor,
            jitter,
        )
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current.min(self.cap);

        // grow the next pause, saturating at the cap
        let next_ms = (current.as_millis() as f64 * self.factor).min(self.cap.as_millis() as f64);
        self.current = Duration::from_millis(next_ms as u64);

        if self.jitter == 0.0 {
            return Some(current);
        }

        let jitter_factor: f64 = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        let jittered = (current.as_millis() as f64) * jitter_factor;
        Some(Duration::from_millis(jittered as u64).min(self.cap))
    }
}
