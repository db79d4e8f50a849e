//! tbauth - Thunderbolt device authorization.
//!
//! This crate decides, per attached Thunderbolt device, whether the device
//! may be granted full data-path access, and performs the handshake against
//! the kernel's sysfs security interface.
//!
//! # Architecture
//!
//! The authorization protocol enforces three ordering invariants:
//!
//! 1. **Identity before anything**: the live `unique_id` attribute must
//!    byte-exactly match the expected uid before any write is attempted.
//!    Attribute files are opened strictly relative to one held directory
//!    descriptor, so a device removed and re-enumerated at the same path
//!    can never be confused with the device we meant to authorize.
//! 2. **Key before grant**: for secure-level links the pre-shared key is
//!    written to the `key` attribute, and the write confirmed, before the
//!    grant byte is written to `authorized`.
//! 3. **One key per uid**: the key store never returns two different keys
//!    for the same uid; a freshly generated key only earns a provisional
//!    user-level grant until the device has confirmed it.
//!
//! # Module Structure
//!
//! - `sysfs`: retry-safe, directory-relative attribute I/O
//! - `keystore`: per-device pre-shared key generation and persistence
//! - `auth`: the authorization protocol itself
//! - `device`: device record and status/policy state machine
//! - `policy`: auto-authorization policy check
//! - `registry`: persistent device registry (SQLite)
//! - `config`: daemon configuration

use std::io;

use thiserror::Error;

pub mod auth;
pub mod config;
pub mod device;
pub mod keystore;
pub mod policy;
pub mod registry;
pub mod sysfs;

pub use auth::{authorize, grant_code, AUTH_CODE_SECURE, AUTH_CODE_USER};
pub use config::TbauthConfig;
pub use device::{Device, Policy, SecurityLevel, Status};
pub use keystore::{Key, KeyStore, KEY_BYTES, KEY_CHARS};
pub use policy::{ensure_auto_authorized, should_auto_authorize};
pub use registry::{DeviceStore, InMemoryDeviceStore, SqliteDeviceStore, StoredDevice};
pub use sysfs::{AttrDir, AttrFile, AttrMode};

/// Failures of the authorization protocol and its collaborators.
///
/// `Verification` is a security event, not a hardware problem: it means
/// the directory we are holding no longer belongs to the device we were
/// asked to authorize.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("i/o error on {attr}: {source}")]
    Io {
        attr: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("unique id verification failed [{found} != {expected}]")]
    Verification { expected: String, found: String },

    #[error("device not found: {0}")]
    NotFound(String),

    #[error("store failure: {0}")]
    Store(String),

    #[error("policy forbids automatic authorization of {0}")]
    Policy(String),
}

impl AuthError {
    pub(crate) fn io(attr: &'static str, source: io::Error) -> Self {
        AuthError::Io { attr, source }
    }

    /// The originating OS error code, if this failure came from a syscall.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            AuthError::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Explicit per-process context, passed to every engine operation.
///
/// Holds the daemon-wide security floor and the handles to the key store
/// and the device registry. There is deliberately no global manager.
pub struct Context {
    security_floor: SecurityLevel,
    keystore: KeyStore,
    registry: Box<dyn DeviceStore>,
}

impl Context {
    pub fn new(
        security_floor: SecurityLevel,
        keystore: KeyStore,
        registry: Box<dyn DeviceStore>,
    ) -> Self {
        Self {
            security_floor,
            keystore,
            registry,
        }
    }

    /// Open key store and registry at the locations named by `cfg`.
    pub fn from_config(cfg: &TbauthConfig) -> Result<Self, AuthError> {
        let keystore = KeyStore::open(&cfg.key_dir)?;
        let registry = SqliteDeviceStore::open(&cfg.db_path)?;
        Ok(Self::new(cfg.security_floor, keystore, Box::new(registry)))
    }

    /// Daemon-wide configured security floor, assumed for devices whose
    /// directory does not report a `security` attribute.
    pub fn security_level(&self) -> SecurityLevel {
        self.security_floor
    }

    pub fn keystore_mut(&mut self) -> &mut KeyStore {
        &mut self.keystore
    }

    pub fn registry_mut(&mut self) -> &mut dyn DeviceStore {
        &mut *self.registry
    }
}
