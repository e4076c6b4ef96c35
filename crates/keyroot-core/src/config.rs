use crate::error::{KeyrootError, KeyrootResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// PBKDF2 iteration policy. Both values are site policy and have no
/// built-in default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pbkdf2Cfg {
    /// Iterations used for new passphrase keys when none are given.
    pub default_iters: u64,

    /// Smallest iteration count accepted from a caller.
    pub min_iters: u64,
}

impl Pbkdf2Cfg {
    pub fn new(default_iters: u64, min_iters: u64) -> KeyrootResult<Self> {
        let cfg = Self {
            default_iters,
            min_iters,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> KeyrootResult<()> {
        if self.min_iters == 0 {
            return Err(KeyrootError::InvalidConfig(
                "pbkdf2.min_iters must be at least 1".to_string(),
            ));
        }
        if self.default_iters < self.min_iters {
            return Err(KeyrootError::InvalidConfig(format!(
                "pbkdf2.default_iters ({}) is below pbkdf2.min_iters ({})",
                self.default_iters, self.min_iters
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZfsCfg {
    #[serde(default)]
    pub zfs_path: Option<String>,

    #[serde(default)]
    pub zpool_path: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for ZfsCfg {
    fn default() -> Self {
        Self {
            zfs_path: None,
            zpool_path: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyrootConfig {
    pub pbkdf2: Pbkdf2Cfg,

    #[serde(default)]
    pub zfs: ZfsCfg,

    #[serde(skip)]
    pub path: PathBuf,
}

impl KeyrootConfig {
    /// Load from TOML (by `.toml` extension) or YAML (anything else).
    pub fn load<P: AsRef<Path>>(path: P) -> KeyrootResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.pbkdf2.validate()?;
        Ok(cfg)
    }

    pub fn zfs_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.zfs.timeout_secs)
    }

    pub fn zfs_binary_path(&self) -> Option<PathBuf> {
        self.zfs.zfs_path.as_ref().map(PathBuf::from)
    }

    pub fn zpool_binary_path(&self) -> Option<PathBuf> {
        self.zfs.zpool_path.as_ref().map(PathBuf::from)
    }
}
