//! Conditional retry till we run out of backoff.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::Condition;

/// Runs `operation` to completion, retrying on error as long as `condition` accepts
/// the error and the backoff `strategy` has durations left. Each retry sleeps for the
/// duration the strategy yields next, so a strategy of `n` durations allows `n + 1`
/// attempts in total. The last observed error is returned once retries are exhausted
/// or the condition rejects it.
pub async fn retry<I, F, Fut, T, E, C>(strategy: I, mut operation: F, condition: C) -> Result<T, E>
where
    I: IntoIterator<Item = Duration>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Condition<E>,
{
    let mut strategy = strategy.into_iter();
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !condition.can_retry(&err) {
                    return Err(err);
                }
                // cool off before the next attempt, or give up if the strategy ran out
                match strategy.next() {
                    Some(pause) => sleep(pause).await,
                    None => return Err(err),
                }
            }
        }
    }
}
