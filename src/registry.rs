//! Persistent device registry.
//!
//! The registry remembers devices the operator has approved: identity,
//! policy and descriptive metadata. Live state (`status`, `syspath`) is
//! never persisted; it is re-derived from sysfs on every connect.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::device::{Device, Policy};
use crate::AuthError;

/// The persisted slice of a [`Device`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredDevice {
    pub uid: String,
    pub policy: Policy,
    pub has_key: bool,
    pub vendor: String,
    pub name: String,
}

impl StoredDevice {
    /// Rebuild a disconnected device record from its stored slice.
    pub fn to_device(&self) -> Device {
        let mut dev = Device::new(&self.uid, &self.vendor, &self.name);
        dev.set_policy(self.policy);
        dev.set_has_key(self.has_key);
        dev
    }
}

pub trait DeviceStore {
    fn lookup(&mut self, uid: &str) -> Result<Option<StoredDevice>, AuthError>;

    fn store(&mut self, device: &Device) -> Result<(), AuthError>;

    /// Destroy the record for `uid`. Returns whether one existed.
    fn forget(&mut self, uid: &str) -> Result<bool, AuthError>;
}

pub struct SqliteDeviceStore {
    conn: Connection,
}

impl SqliteDeviceStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AuthError::Store(format!("create registry dir {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(db_path)
            .map_err(|e| AuthError::Store(format!("open registry {}: {e}", db_path.display())))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    /// In-memory registry, useful for tests that want real SQL behavior.
    pub fn open_in_memory() -> Result<Self, AuthError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AuthError::Store(format!("open in-memory registry: {e}")))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<(), AuthError> {
        self.conn
            .execute_batch(
                r#"
                PRAGMA journal_mode=WAL;

                CREATE TABLE IF NOT EXISTS devices (
                  uid TEXT PRIMARY KEY,
                  policy TEXT NOT NULL,
                  has_key INTEGER NOT NULL DEFAULT 0,
                  vendor TEXT NOT NULL DEFAULT '',
                  name TEXT NOT NULL DEFAULT ''
                );
                "#,
            )
            .map_err(|e| AuthError::Store(format!("registry schema: {e}")))
    }
}

impl DeviceStore for SqliteDeviceStore {
    fn lookup(&mut self, uid: &str) -> Result<Option<StoredDevice>, AuthError> {
        let row = self
            .conn
            .query_row(
                "SELECT uid, policy, has_key, vendor, name FROM devices WHERE uid = ?1",
                params![uid],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| AuthError::Store(format!("lookup {uid}: {e}")))?;

        let Some((uid, policy, has_key, vendor, name)) = row else {
            return Ok(None);
        };
        let policy = policy
            .parse::<Policy>()
            .map_err(|e| AuthError::Store(format!("registry row for {uid} is corrupt: {e}")))?;
        Ok(Some(StoredDevice {
            uid,
            policy,
            has_key,
            vendor,
            name,
        }))
    }

    fn store(&mut self, device: &Device) -> Result<(), AuthError> {
        self.conn
            .execute(
                r#"
                INSERT INTO devices (uid, policy, has_key, vendor, name)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(uid) DO UPDATE SET
                  policy = excluded.policy,
                  has_key = excluded.has_key,
                  vendor = excluded.vendor,
                  name = excluded.name
                "#,
                params![
                    device.uid(),
                    device.policy().to_string(),
                    device.has_key(),
                    device.vendor(),
                    device.name(),
                ],
            )
            .map_err(|e| AuthError::Store(format!("store {}: {e}", device.uid())))?;
        Ok(())
    }

    fn forget(&mut self, uid: &str) -> Result<bool, AuthError> {
        let n = self
            .conn
            .execute("DELETE FROM devices WHERE uid = ?1", params![uid])
            .map_err(|e| AuthError::Store(format!("forget {uid}: {e}")))?;
        Ok(n > 0)
    }
}

/// Map-backed registry for tests.
#[derive(Default)]
pub struct InMemoryDeviceStore {
    devices: HashMap<String, StoredDevice>,
}

impl InMemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceStore for InMemoryDeviceStore {
    fn lookup(&mut self, uid: &str) -> Result<Option<StoredDevice>, AuthError> {
        Ok(self.devices.get(uid).cloned())
    }

    fn store(&mut self, device: &Device) -> Result<(), AuthError> {
        self.devices.insert(
            device.uid().to_string(),
            StoredDevice {
                uid: device.uid().to_string(),
                policy: device.policy(),
                has_key: device.has_key(),
                vendor: device.vendor().to_string(),
                name: device.name().to_string(),
            },
        );
        Ok(())
    }

    fn forget(&mut self, uid: &str) -> Result<bool, AuthError> {
        Ok(self.devices.remove(uid).is_some())
    }
}
