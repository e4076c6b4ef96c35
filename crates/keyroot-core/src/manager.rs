//! Key lifecycle against the storage layer: load, unload and rewrap of an
//! encryption root's wrapping key, plus the crypto parameters for new
//! datasets and clones.

use crate::acquire::{KeyRequest, KeySource};
use crate::config::{KeyrootConfig, Pbkdf2Cfg};
use crate::derive::{derive_key, WrappingKey};
use crate::error::{ErrorKind, KeyrootError, KeyrootResult, ResultExt};
use crate::format::KeyFormat;
use crate::policy::{
    clone_decision, create_decision, resolve_pbkdf2_iters, rewrap_decision, CryptoDecision,
    KeyPlan, RewrapMode, RewrapPlan,
};
use crate::props::{
    parent_name, Crypt, DatasetCryptoProps, ExplicitProps, KeyLocation, KeyStatus, PropertyDelta,
};
use crate::provider::{DatasetTree, KeyTransport, TransportError};
use log::{debug, info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::BTreeMap;

/// Interactive attempts allowed for a single load, the first entry included.
pub const MAX_KEY_PROMPT_ATTEMPTS: u32 = 3;

/// Where a dataset is being created.
#[derive(Debug, Clone, Copy)]
pub enum CreateTarget<'a> {
    /// Below an existing dataset.
    Child { parent: &'a str },
    /// The root dataset of a pool being created; the feature flag comes from
    /// the pending pool properties.
    PoolRoot { encryption_feature: bool },
}

/// Crypto outcome of a create or clone.
#[derive(Debug)]
pub struct EncryptionParams {
    pub decision: CryptoDecision,
    /// Properties to persist with the new dataset.
    pub delta: PropertyDelta,
    /// Present iff the dataset becomes a new encryption root.
    pub wrapping_key: Option<WrappingKey>,
}

impl EncryptionParams {
    fn without_key(decision: CryptoDecision) -> Self {
        Self {
            decision,
            delta: PropertyDelta::default(),
            wrapping_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum KeyOp {
    Load,
    Unload,
    Change,
}

/// Drives key-state transitions for datasets served by `P`.
pub struct KeyManager<P> {
    provider: P,
    pbkdf2: Pbkdf2Cfg,
}

impl<P: DatasetTree + KeyTransport> KeyManager<P> {
    pub fn new(provider: P, pbkdf2: Pbkdf2Cfg) -> Self {
        Self { provider, pbkdf2 }
    }

    pub fn from_config(provider: P, config: &KeyrootConfig) -> Self {
        Self::new(provider, config.pbkdf2)
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn pbkdf2_policy(&self) -> &Pbkdf2Cfg {
        &self.pbkdf2
    }

    /// Load the wrapping key of the encryption root `dataset`.
    ///
    /// Key material comes from `alt_keylocation` when given, otherwise from
    /// the dataset's `keylocation`. With `noop` the key is only verified and
    /// an already loaded key is not an error. A wrong key typed at a terminal
    /// is asked for again, up to [`MAX_KEY_PROMPT_ATTEMPTS`] entries in total.
    pub fn load_key<S: KeySource + ?Sized>(
        &self,
        dataset: &str,
        noop: bool,
        alt_keylocation: Option<&KeyLocation>,
        source: &mut S,
    ) -> KeyrootResult<()> {
        self.try_load_key(dataset, noop, alt_keylocation, source)
            .context("Key load error")
    }

    fn try_load_key<S: KeySource + ?Sized>(
        &self,
        dataset: &str,
        noop: bool,
        alt_keylocation: Option<&KeyLocation>,
        source: &mut S,
    ) -> KeyrootResult<()> {
        let props = self.encryption_root_props(dataset, "loaded")?;

        if !noop && props.keystatus == KeyStatus::Available {
            return Err(KeyrootError::AlreadyInState(format!(
                "Key already loaded for '{dataset}'."
            )));
        }

        let (salt, iters) = match props.keyformat {
            KeyFormat::Passphrase => (props.pbkdf2_salt, props.pbkdf2_iters),
            _ => (0, 0),
        };
        let request = KeyRequest {
            location: alt_keylocation.unwrap_or(&props.keylocation),
            format: props.keyformat,
            dataset: Some(dataset),
            verify: false,
            new_key: false,
        };

        let mut attempt = 1;
        loop {
            let material = source.acquire(&request)?;
            let key = derive_key(props.keyformat, iters, material.as_bytes(), salt)?;

            match self.provider.load_key(dataset, noop, &key) {
                Ok(()) => {
                    if noop {
                        info!("verified key for {dataset}");
                    } else {
                        info!("loaded key for {dataset}");
                    }
                    return Ok(());
                }
                Err(TransportError::AccessDenied)
                    if material.can_retry() && attempt < MAX_KEY_PROMPT_ATTEMPTS =>
                {
                    warn!(
                        "incorrect key for {dataset} (attempt {attempt} of {MAX_KEY_PROMPT_ATTEMPTS})"
                    );
                    attempt += 1;
                }
                Err(err) => return Err(transport_error(KeyOp::Load, dataset, err)),
            }
        }
    }

    /// Unload the wrapping key of the encryption root `dataset`.
    pub fn unload_key(&self, dataset: &str) -> KeyrootResult<()> {
        self.try_unload_key(dataset).context("Key unload error")
    }

    fn try_unload_key(&self, dataset: &str) -> KeyrootResult<()> {
        let props = self.encryption_root_props(dataset, "unloaded")?;

        if props.keystatus == KeyStatus::Unavailable {
            return Err(KeyrootError::AlreadyInState(format!(
                "Key already unloaded for '{dataset}'."
            )));
        }

        self.provider
            .unload_key(dataset)
            .map_err(|err| transport_error(KeyOp::Unload, dataset, err))?;
        info!("unloaded key for {dataset}");
        Ok(())
    }

    /// Rewrap `dataset`'s data key.
    ///
    /// `Rekey` collects a new wrapping key; `props` may carry `keyformat`,
    /// `keylocation` and `pbkdf2iters` and nothing else. `InheritFromParent`
    /// switches the dataset to its parent's key and ignores `props`.
    pub fn change_key<S: KeySource + ?Sized>(
        &self,
        dataset: &str,
        mode: RewrapMode,
        props: &BTreeMap<String, String>,
        source: &mut S,
    ) -> KeyrootResult<()> {
        self.try_change_key(dataset, mode, props, source)
            .context("Key change error")
    }

    fn try_change_key<S: KeySource + ?Sized>(
        &self,
        dataset: &str,
        mode: RewrapMode,
        props: &BTreeMap<String, String>,
        source: &mut S,
    ) -> KeyrootResult<()> {
        self.require_feature(dataset)?;
        let current = self.provider.crypto_props(dataset)?;
        if !current.crypt.is_encrypted() {
            return Err(KeyrootError::invalid("Dataset not encrypted."));
        }

        let explicit = match mode {
            RewrapMode::Rekey => ExplicitProps::from_rewrap_props(props)?,
            RewrapMode::InheritFromParent => ExplicitProps::default(),
        };
        let parent = match (mode, parent_name(dataset)) {
            (RewrapMode::InheritFromParent, Some(parent)) => Some(self.lookup_parent(parent)?),
            _ => None,
        };

        let (delta, key) = match rewrap_decision(&current, mode, &explicit, parent.as_ref())? {
            RewrapPlan::Rekey(plan) => {
                let (delta, key) = self.collect_new_key(
                    &plan,
                    Some(dataset),
                    explicit.pbkdf2_iters,
                    true,
                    source,
                )?;
                (delta, Some(key))
            }
            RewrapPlan::Inherit => (PropertyDelta::default(), None),
        };

        self.provider
            .change_key(dataset, &delta, key.as_ref())
            .map_err(|err| transport_error(KeyOp::Change, dataset, err))?;

        match key {
            Some(_) => info!("changed wrapping key for {dataset}"),
            None => info!("{dataset} now inherits its parent's key"),
        }
        Ok(())
    }

    /// Crypto parameters for a new dataset at `target` with properties
    /// `props`. Non-crypto property names are ignored.
    pub fn create_encryption_params<S: KeySource + ?Sized>(
        &self,
        target: CreateTarget<'_>,
        props: &BTreeMap<String, String>,
        source: &mut S,
    ) -> KeyrootResult<EncryptionParams> {
        self.try_create_encryption_params(target, props, source)
            .context("Encryption create error")
    }

    fn try_create_encryption_params<S: KeySource + ?Sized>(
        &self,
        target: CreateTarget<'_>,
        props: &BTreeMap<String, String>,
        source: &mut S,
    ) -> KeyrootResult<EncryptionParams> {
        let explicit = ExplicitProps::from_props(props)?;
        let (parent_crypt, feature_enabled) = match target {
            CreateTarget::Child { parent } => {
                let parent_props = self.lookup_parent(parent)?;
                (parent_props.crypt, self.provider.encryption_enabled(parent)?)
            }
            CreateTarget::PoolRoot { encryption_feature } => (Crypt::Off, encryption_feature),
        };

        let decision = create_decision(parent_crypt, &explicit, feature_enabled)?;
        debug!("create decision: {decision:?}");
        self.finish_params(decision, explicit.pbkdf2_iters, source)
    }

    /// Crypto parameters for a clone of `origin` created below `parent`.
    pub fn clone_encryption_params<S: KeySource + ?Sized>(
        &self,
        origin: &str,
        parent: &str,
        props: &BTreeMap<String, String>,
        source: &mut S,
    ) -> KeyrootResult<EncryptionParams> {
        self.try_clone_encryption_params(origin, parent, props, source)
            .context("Encryption clone error")
    }

    fn try_clone_encryption_params<S: KeySource + ?Sized>(
        &self,
        origin: &str,
        parent: &str,
        props: &BTreeMap<String, String>,
        source: &mut S,
    ) -> KeyrootResult<EncryptionParams> {
        let explicit = ExplicitProps::from_props(props)?;
        let parent_props = self.lookup_parent(parent)?;
        let origin_props = self.provider.crypto_props(origin)?;

        let decision = clone_decision(
            parent_props.crypt,
            origin_props.crypt,
            origin_props.keystatus,
            &explicit,
        )?;
        debug!("clone decision for {origin}: {decision:?}");
        self.finish_params(decision, explicit.pbkdf2_iters, source)
    }

    fn finish_params<S: KeySource + ?Sized>(
        &self,
        decision: CryptoDecision,
        explicit_iters: Option<u64>,
        source: &mut S,
    ) -> KeyrootResult<EncryptionParams> {
        let plan = match &decision {
            CryptoDecision::NewRoot(plan) => plan,
            _ => return Ok(EncryptionParams::without_key(decision)),
        };
        let (delta, key) = self.collect_new_key(plan, None, explicit_iters, false, source)?;
        Ok(EncryptionParams {
            decision,
            delta,
            wrapping_key: Some(key),
        })
    }

    /// Acquire, check and derive a new wrapping key for `plan`, filling in
    /// a fresh salt and the iteration count for passphrase keys.
    fn collect_new_key<S: KeySource + ?Sized>(
        &self,
        plan: &KeyPlan,
        dataset: Option<&str>,
        explicit_iters: Option<u64>,
        new_key: bool,
        source: &mut S,
    ) -> KeyrootResult<(PropertyDelta, WrappingKey)> {
        let iters = resolve_pbkdf2_iters(plan.keyformat, explicit_iters, &self.pbkdf2)?;

        let material = source.acquire(&KeyRequest {
            location: &plan.keylocation,
            format: plan.keyformat,
            dataset,
            verify: true,
            new_key,
        })?;

        let mut delta = plan.delta.clone();
        let (salt, iters) = match iters {
            Some(iters) => {
                let salt = OsRng.next_u64();
                delta.pbkdf2_salt = Some(salt);
                delta.pbkdf2_iters = Some(iters);
                (salt, iters)
            }
            None => (0, 0),
        };

        let key = derive_key(plan.keyformat, iters, material.as_bytes(), salt)?;
        Ok((delta, key))
    }

    fn require_feature(&self, dataset: &str) -> KeyrootResult<()> {
        if self.provider.encryption_enabled(dataset)? {
            Ok(())
        } else {
            Err(KeyrootError::invalid("Encryption feature not enabled."))
        }
    }

    /// Properties of `dataset` after checking it is an encrypted encryption
    /// root. `verb` completes "Keys must be ... for encryption root".
    fn encryption_root_props(
        &self,
        dataset: &str,
        verb: &str,
    ) -> KeyrootResult<DatasetCryptoProps> {
        self.require_feature(dataset)?;
        let props = self.provider.crypto_props(dataset)?;

        if props.keyformat == KeyFormat::None {
            return Err(KeyrootError::invalid(format!(
                "'{dataset}' is not encrypted."
            )));
        }
        if let Some(root) = props.inherited_from() {
            return Err(KeyrootError::invalid(format!(
                "Keys must be {verb} for encryption root of '{dataset}' ({root})."
            )));
        }
        Ok(props)
    }

    fn lookup_parent(&self, parent: &str) -> KeyrootResult<DatasetCryptoProps> {
        self.provider.crypto_props(parent).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                KeyrootError::NotFound("Failed to lookup parent.".to_string())
            } else {
                err
            }
        })
    }
}

fn transport_error(op: KeyOp, dataset: &str, err: TransportError) -> KeyrootError {
    match (op, err) {
        (KeyOp::Change, TransportError::InvalidArgument) => {
            KeyrootError::invalid("Invalid properties for key change.")
        }
        (_, TransportError::InvalidArgument) => {
            KeyrootError::invalid(format!("Invalid parameters provided for {dataset}."))
        }
        (KeyOp::Load, TransportError::AccessDenied) => {
            KeyrootError::AccessDenied(format!("Incorrect key provided for '{dataset}'."))
        }
        (KeyOp::Change, TransportError::AccessDenied) => {
            KeyrootError::AccessDenied("Key is not currently loaded.".to_string())
        }
        (KeyOp::Unload, TransportError::AccessDenied) => {
            KeyrootError::AccessDenied(format!("Permission denied for '{dataset}'."))
        }
        (_, TransportError::AlreadyLoaded) => {
            KeyrootError::AlreadyInState(format!("Key already loaded for '{dataset}'."))
        }
        (_, TransportError::NotLoaded) => {
            KeyrootError::AlreadyInState(format!("Key already unloaded for '{dataset}'."))
        }
        (_, TransportError::Busy) => KeyrootError::Busy(format!("'{dataset}' is busy.")),
        (_, TransportError::NotFound) => {
            KeyrootError::NotFound(format!("Dataset '{dataset}' does not exist."))
        }
        (_, TransportError::Io(err)) => KeyrootError::Io(err),
    }
}
