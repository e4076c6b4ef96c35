//! Test doubles shared across the crate's unit tests.

use crate::acquire::{KeyMaterial, KeyRequest, KeySource};
use crate::derive::WrappingKey;
use crate::error::{KeyrootError, KeyrootResult};
use crate::format::{KeyFormat, WRAPPING_KEY_LEN};
use crate::props::{
    parent_name, Crypt, DatasetCryptoProps, KeyLocation, KeyStatus, PropSource, PropertyDelta,
};
use crate::provider::{DatasetTree, KeyTransport, TransportError};
use crate::terminal::TerminalControl;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{self, BufRead, Read};
use std::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct TermState {
    pub echo_disabled: bool,
    pub handlers_installed: bool,
    pub sessions: usize,
    pub raised: Vec<i32>,
    interrupt_next: Option<i32>,
    fail_secure: bool,
}

/// Records what a secure session did to the "terminal".
#[derive(Default)]
pub struct FakeTerminal {
    state: Mutex<TermState>,
}

impl FakeTerminal {
    pub fn snapshot(&self) -> TermState {
        self.state.lock().unwrap().clone()
    }

    /// Pretend `signal` arrives while the next session is open.
    pub fn interrupt_during_session(&self, signal: i32) {
        self.state.lock().unwrap().interrupt_next = Some(signal);
    }

    pub fn fail_secure(&self) {
        self.state.lock().unwrap().fail_secure = true;
    }
}

impl TerminalControl for FakeTerminal {
    type Saved = ();

    fn secure(&self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_secure {
            return Err(io::Error::new(io::ErrorKind::Other, "not a terminal"));
        }
        state.echo_disabled = true;
        state.handlers_installed = true;
        state.sessions += 1;
        Ok(())
    }

    fn restore(&self, _saved: ()) -> Option<i32> {
        let mut state = self.state.lock().unwrap();
        state.echo_disabled = false;
        state.handlers_installed = false;
        state.interrupt_next.take()
    }

    fn raise(&self, signal: i32) {
        self.state.lock().unwrap().raised.push(signal);
    }
}

/// Input whose every read is cut short by a signal.
pub struct InterruptedInput;

impl Read for InterruptedInput {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::Interrupted))
    }
}

impl BufRead for InterruptedInput {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        Err(io::Error::from(io::ErrorKind::Interrupted))
    }

    fn consume(&mut self, _amt: usize) {}
}

/// Hands out queued key material and remembers what was asked for.
#[derive(Default)]
pub struct ScriptedSource {
    entries: VecDeque<(Vec<u8>, bool)>,
    pub requests: Vec<SeenRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenRequest {
    pub location: KeyLocation,
    pub format: KeyFormat,
    pub dataset: Option<String>,
    pub verify: bool,
    pub new_key: bool,
}

impl ScriptedSource {
    /// Entries typed at a terminal (retryable).
    pub fn typed(entries: &[&[u8]]) -> Self {
        Self::with(entries, true)
    }

    /// Entries read from a file or pipe (not retryable).
    pub fn piped(entries: &[&[u8]]) -> Self {
        Self::with(entries, false)
    }

    fn with(entries: &[&[u8]], can_retry: bool) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|entry| (entry.to_vec(), can_retry))
                .collect(),
            requests: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.entries.len()
    }
}

impl KeySource for ScriptedSource {
    fn acquire(&mut self, request: &KeyRequest<'_>) -> KeyrootResult<KeyMaterial> {
        self.requests.push(SeenRequest {
            location: request.location.clone(),
            format: request.format,
            dataset: request.dataset.map(str::to_string),
            verify: request.verify,
            new_key: request.new_key,
        });
        let (bytes, can_retry) = self
            .entries
            .pop_front()
            .ok_or_else(|| KeyrootError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)))?;
        request.format.validate(&bytes)?;
        Ok(KeyMaterial::new(bytes, can_retry))
    }
}

/// Recorded `change_key` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    pub dataset: String,
    pub delta: PropertyDelta,
    pub key: Option<[u8; WRAPPING_KEY_LEN]>,
}

#[derive(Default)]
struct PoolState {
    feature_disabled: bool,
    datasets: BTreeMap<String, DatasetCryptoProps>,
    /// Wrapping key each encryption root was created with.
    keys: BTreeMap<String, [u8; WRAPPING_KEY_LEN]>,
    loaded: BTreeSet<String>,
    unreadable: BTreeSet<String>,
    busy: BTreeSet<String>,
    load_calls: Vec<(String, bool)>,
    unload_calls: Vec<String>,
    changes: Vec<KeyChange>,
}

/// In-memory pool that is both the dataset tree and the key transport.
/// Key status of a non-root follows its encryption root.
#[derive(Default)]
pub struct MemoryPool {
    state: Mutex<PoolState>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disable_feature(&self) {
        self.state.lock().unwrap().feature_disabled = true;
    }

    pub fn add_plain(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .datasets
            .insert(name.to_string(), DatasetCryptoProps::default());
    }

    /// Add an encryption root whose correct wrapping key is `key`.
    pub fn add_root(
        &self,
        name: &str,
        keyformat: KeyFormat,
        keylocation: KeyLocation,
        salt: u64,
        iters: u64,
        key: &WrappingKey,
    ) {
        let props = DatasetCryptoProps {
            crypt: Crypt::Aes256Gcm,
            keyformat,
            keylocation,
            keylocation_source: PropSource::Local,
            pbkdf2_salt: salt,
            pbkdf2_iters: iters,
            keystatus: KeyStatus::Unavailable,
        };
        let mut state = self.state.lock().unwrap();
        state.datasets.insert(name.to_string(), props);
        state.keys.insert(name.to_string(), *key.as_bytes());
    }

    /// Add an encrypted dataset inheriting its key from `root`.
    pub fn add_child(&self, name: &str, root: &str) {
        let mut state = self.state.lock().unwrap();
        let mut props = state.datasets.get(root).cloned().unwrap_or_default();
        props.keylocation_source = PropSource::Inherited(root.to_string());
        state.datasets.insert(name.to_string(), props);
    }

    pub fn mark_loaded(&self, root: &str) {
        self.state.lock().unwrap().loaded.insert(root.to_string());
    }

    pub fn mark_unreadable(&self, name: &str) {
        self.state.lock().unwrap().unreadable.insert(name.to_string());
    }

    pub fn mark_busy(&self, name: &str) {
        self.state.lock().unwrap().busy.insert(name.to_string());
    }

    pub fn is_loaded(&self, root: &str) -> bool {
        self.state.lock().unwrap().loaded.contains(root)
    }

    pub fn load_calls(&self) -> Vec<(String, bool)> {
        self.state.lock().unwrap().load_calls.clone()
    }

    pub fn unload_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().unload_calls.clone()
    }

    pub fn changes(&self) -> Vec<KeyChange> {
        self.state.lock().unwrap().changes.clone()
    }

    pub fn props(&self, name: &str) -> Option<DatasetCryptoProps> {
        self.state.lock().unwrap().datasets.get(name).cloned()
    }
}

impl PoolState {
    fn root_of<'a>(&'a self, name: &'a str, props: &'a DatasetCryptoProps) -> &'a str {
        props.inherited_from().unwrap_or(name)
    }

    fn require(&self, name: &str) -> Result<&DatasetCryptoProps, TransportError> {
        self.datasets.get(name).ok_or(TransportError::NotFound)
    }
}

impl DatasetTree for MemoryPool {
    fn encryption_enabled(&self, _dataset: &str) -> KeyrootResult<bool> {
        Ok(!self.state.lock().unwrap().feature_disabled)
    }

    fn crypto_props(&self, dataset: &str) -> KeyrootResult<DatasetCryptoProps> {
        let state = self.state.lock().unwrap();
        if state.unreadable.contains(dataset) {
            return Err(KeyrootError::Provider(format!(
                "cannot read properties of {dataset}"
            )));
        }
        let mut props = state
            .datasets
            .get(dataset)
            .cloned()
            .ok_or_else(|| KeyrootError::NotFound(format!("dataset '{dataset}' does not exist")))?;
        if props.crypt.is_encrypted() && state.loaded.contains(state.root_of(dataset, &props)) {
            props.keystatus = KeyStatus::Available;
        }
        Ok(props)
    }

    fn children(&self, dataset: &str) -> KeyrootResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .datasets
            .keys()
            .filter(|name| parent_name(name) == Some(dataset))
            .cloned()
            .collect())
    }
}

impl KeyTransport for MemoryPool {
    fn load_key(
        &self,
        dataset: &str,
        noop: bool,
        key: &WrappingKey,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.load_calls.push((dataset.to_string(), noop));
        let props = state.require(dataset)?;
        if !props.is_encryption_root() {
            return Err(TransportError::InvalidArgument);
        }
        if state.busy.contains(dataset) {
            return Err(TransportError::Busy);
        }
        if !noop && state.loaded.contains(dataset) {
            return Err(TransportError::AlreadyLoaded);
        }
        if state.keys.get(dataset) != Some(key.as_bytes()) {
            return Err(TransportError::AccessDenied);
        }
        if !noop {
            state.loaded.insert(dataset.to_string());
        }
        Ok(())
    }

    fn unload_key(&self, dataset: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.unload_calls.push(dataset.to_string());
        state.require(dataset)?;
        if state.busy.contains(dataset) {
            return Err(TransportError::Busy);
        }
        if !state.loaded.remove(dataset) {
            return Err(TransportError::NotLoaded);
        }
        Ok(())
    }

    fn change_key(
        &self,
        dataset: &str,
        delta: &PropertyDelta,
        key: Option<&WrappingKey>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.changes.push(KeyChange {
            dataset: dataset.to_string(),
            delta: delta.clone(),
            key: key.map(|key| *key.as_bytes()),
        });
        let mut props = state.require(dataset)?.clone();
        match key {
            Some(key) => {
                if let Some(format) = delta.keyformat {
                    props.keyformat = format;
                }
                if let Some(location) = &delta.keylocation {
                    props.keylocation = location.clone();
                }
                if let Some(salt) = delta.pbkdf2_salt {
                    props.pbkdf2_salt = salt;
                }
                if let Some(iters) = delta.pbkdf2_iters {
                    props.pbkdf2_iters = iters;
                }
                state.keys.insert(dataset.to_string(), *key.as_bytes());
            }
            None => {
                let parent = parent_name(dataset).ok_or(TransportError::InvalidArgument)?;
                let parent_props = state.require(parent)?;
                let root = state.root_of(parent, parent_props).to_string();
                props.keyformat = parent_props.keyformat;
                props.keylocation_source = PropSource::Inherited(root);
                state.keys.remove(dataset);
                state.loaded.remove(dataset);
            }
        }
        state.datasets.insert(dataset.to_string(), props);
        Ok(())
    }
}
