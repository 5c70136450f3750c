//! Backoff strategies. A strategy is an iterator with `Item = Duration` deciding how
//! long to pause before each retry. Since it is an iterator, the number of retries can
//! be bounded with [`take`](https://doc.rust-lang.org/std/iter/struct.Iterator.html#method.take).

pub mod exponential;
pub mod fixed;
