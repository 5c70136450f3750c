use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Missing Dedup Key - {0}")]
    MissingKey(String),

    #[error("Store Error - {0}")]
    Store(String),

    #[error("Store Capacity Error - {0}")]
    StoreCapacity(String),

    #[error("Forwarder Error - {0}")]
    Forwarder(String),

    #[error("metrics Error - {0}")]
    Metrics(String),
}
