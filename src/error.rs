use thiserror::Error;

use crate::runtime::RuntimeError;
use crate::store::StoreError;
use crate::vault::VaultError;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
