//! System-backed dataset tree for the key manager. `system` holds the
//! provider, while `command` and `parse` cover the shell integration.

mod command;
mod parse;
mod system;

pub use system::{SystemZfsProvider, DEFAULT_ZFS_PATHS, DEFAULT_ZPOOL_PATHS};
