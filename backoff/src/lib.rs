//! Retry with backoff for async Rust.
//!
//! An operation that can fail transiently is run again until it succeeds, until its
//! error is no longer worth retrying, or until the backoff [`strategy`] runs out.
//! A strategy is just an `Iterator<Item = Duration>`; every yielded duration is the
//! pause before the next attempt, so exhausting the iterator ends the retries (e.g.
//! via [`take`](https://doc.rust-lang.org/std/iter/struct.Iterator.html#method.take)).
//! Whether an error is retryable at all is decided by a [`Condition`].
//!
//! ```rust
//! use backoff::retry::retry;
//! use backoff::strategy::fixed;
//!
//! async fn some_work() -> Result<u64, ()> {
//!     Ok(42)
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let interval = fixed::Interval::from_millis(1).take(3);
//!     let result = retry(interval, some_work, |_: &()| true).await;
//!     assert_eq!(result, Ok(42));
//! }
//! ```

pub mod retry;
pub mod strategy;

/// Decides whether an error is worth another attempt. [`Condition::can_retry`]
/// returns `true` to keep retrying or `false` to give up immediately.
pub trait Condition<E> {
    fn can_retry(&self, error: &E) -> bool;
}

/// Any `Fn(&E) -> bool` can act as the condition.
impl<E, F> Condition<E> for F
where
    F: Fn(&E) -> bool,
{
    fn can_retry(&self, error: &E) -> bool {
        self(error)
    }
}
