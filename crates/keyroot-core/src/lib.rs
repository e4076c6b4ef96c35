pub mod acquire;
pub mod config;
pub mod derive;
pub mod error;
pub mod format;
pub mod logging;
pub mod manager;
pub mod policy;
pub mod props;
pub mod provider;
pub mod recursive;
pub mod terminal;

#[cfg(test)]
pub(crate) mod testing;

pub use acquire::{acquire_from_file, Console, KeyMaterial, KeyRequest, KeySource};
pub use config::{KeyrootConfig, Pbkdf2Cfg, ZfsCfg};
pub use derive::{derive_key, WrappingKey};
pub use error::{ErrorKind, KeyrootError, KeyrootResult, ResultExt};
pub use format::KeyFormat;
pub use manager::{CreateTarget, EncryptionParams, KeyManager, MAX_KEY_PROMPT_ATTEMPTS};
pub use policy::{CryptoDecision, KeyPlan, RewrapMode, RewrapPlan};
pub use props::{
    Crypt, DatasetCryptoProps, ExplicitProps, KeyLocation, KeyStatus, PropSource, PropertyDelta,
};
pub use provider::{DatasetTree, KeyTransport, TransportError};
pub use recursive::{load_tree, LoadTreeReport};
