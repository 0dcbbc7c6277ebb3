use fragment_core::errors::{ProviderError, RegistryError};
use fragment_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("controller is shut down")]
    Closed,

    #[error("event queue is full")]
    Backpressure,
}
