use crate::derive::WrappingKey;
use crate::error::KeyrootResult;
use crate::props::{DatasetCryptoProps, PropertyDelta};
use thiserror::Error;

/// Read-only view of the dataset tree and its crypto properties.
///
/// Implementations are expected to provide a thin, testable surface over the
/// underlying system interface (CLI, library bindings, etc.), so the policy
/// and lifecycle code can be exercised without a real pool.
pub trait DatasetTree {
    /// Whether the pool holding `dataset` has the encryption feature enabled.
    fn encryption_enabled(&self, dataset: &str) -> KeyrootResult<bool>;

    /// Crypto properties of `dataset`, including the keylocation's source
    /// and the current key status. Unknown datasets yield `NotFound`.
    fn crypto_props(&self, dataset: &str) -> KeyrootResult<DatasetCryptoProps>;

    /// Direct filesystem and volume children of `dataset`.
    fn children(&self, dataset: &str) -> KeyrootResult<Vec<String>>;
}

/// Outcomes of the storage-layer key primitives.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("key already loaded")]
    AlreadyLoaded,
    #[error("key not loaded")]
    NotLoaded,
    #[error("dataset busy")]
    Busy,
    #[error("permission denied")]
    AccessDenied,
    #[error("dataset not found")]
    NotFound,
    #[error("transport failure: {0}")]
    Io(#[from] std::io::Error),
}

/// The storage layer's key primitives. The wrapping key is borrowed for the
/// duration of the call only.
pub trait KeyTransport {
    /// Hand `key` to the storage layer. With `noop` the key is only checked.
    fn load_key(&self, dataset: &str, noop: bool, key: &WrappingKey)
        -> Result<(), TransportError>;

    /// Drop the loaded key for `dataset`.
    fn unload_key(&self, dataset: &str) -> Result<(), TransportError>;

    /// Rewrap `dataset`'s data key. `key` is `None` when the dataset is
    /// switching to its parent's key.
    fn change_key(
        &self,
        dataset: &str,
        delta: &PropertyDelta,
        key: Option<&WrappingKey>,
    ) -> Result<(), TransportError>;
}
