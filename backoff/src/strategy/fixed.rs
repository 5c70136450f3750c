use std::time::Duration;

/// A fixed interval strategy which repeats itself every X duration.
#[derive(Debug, Clone)]
pub struct Interval {
    interval: Duration,
}

impl Interval {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self {
            interval: Duration::from_millis(millis),
        }
    }
}

impl Iterator for Interval {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.interval)
    }
}
