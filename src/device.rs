//! Device record and the status/policy state machine.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Security tier reported by the device/controller.
///
/// This is the *level*, not the grant code written to `authorized`; the
/// mapping between the two lives in [`crate::auth::grant_code`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// No authorization required; the device is always usable.
    None,
    /// Devices are authorized by the user, identity checked only.
    User,
    /// Devices are authorized with a pre-shared key the device verifies.
    Secure,
    /// Only the DisplayPort tunnel is established; nothing to grant.
    /// Vendor-reported, never selected by the engine.
    DpOnly,
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecurityLevel::None => "none",
            SecurityLevel::User => "user",
            SecurityLevel::Secure => "secure",
            SecurityLevel::DpOnly => "dponly",
        };
        f.write_str(s)
    }
}

impl FromStr for SecurityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SecurityLevel::None),
            "user" => Ok(SecurityLevel::User),
            "secure" => Ok(SecurityLevel::Secure),
            "dponly" => Ok(SecurityLevel::DpOnly),
            other => Err(format!("unknown security level {other:?}")),
        }
    }
}

/// Operator-set policy for future reconnects of a known device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Manual,
    Auto,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Manual => f.write_str("manual"),
            Policy::Auto => f.write_str("auto"),
        }
    }
}

impl FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Policy::Manual),
            "auto" => Ok(Policy::Auto),
            other => Err(format!("unknown policy {other:?}")),
        }
    }
}

/// Where a device is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Disconnected,
    Connected,
    Authorizing,
    Authorized,
    AuthError,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Disconnected => "disconnected",
            Status::Connected => "connected",
            Status::Authorizing => "authorizing",
            Status::Authorized => "authorized",
            Status::AuthError => "auth-error",
        };
        f.write_str(s)
    }
}

/// One Thunderbolt device as tbauth sees it.
///
/// `uid` is assigned by the device itself and never changes for the
/// lifetime of the record; it is the correlation key for authorization,
/// key material and the registry. `syspath` is only meaningful while the
/// device is connected.
#[derive(Clone, Debug)]
pub struct Device {
    uid: String,
    syspath: Option<PathBuf>,
    security_level: SecurityLevel,
    policy: Policy,
    status: Status,
    has_key: bool,
    vendor: String,
    name: String,
}

impl Device {
    pub fn new(uid: impl Into<String>, vendor: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            syspath: None,
            security_level: SecurityLevel::None,
            policy: Policy::Manual,
            status: Status::Disconnected,
            has_key: false,
            vendor: vendor.into(),
            name: name.into(),
        }
    }

    /// Hotplug attach: the device (re)appeared with a fresh sysfs path.
    ///
    /// Reconnecting while `Authorized` is not a shortcut; the kernel-side
    /// grant does not survive a physical reconnect, so the status drops
    /// back to `Connected` and the protocol simply runs again.
    pub fn connected(&mut self, syspath: impl Into<PathBuf>, level: SecurityLevel) -> Status {
        self.syspath = Some(syspath.into());
        self.security_level = level;
        self.status = Status::Connected;
        self.status
    }

    /// Hotplug detach: invalidates the live path, keeps the record.
    pub fn disconnected(&mut self) -> Status {
        self.syspath = None;
        self.status = Status::Disconnected;
        self.status
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.status, Status::Disconnected)
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn syspath(&self) -> Option<&Path> {
        self.syspath.as_deref()
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: Policy) {
        self.policy = policy;
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn has_key(&self) -> bool {
        self.has_key
    }

    pub(crate) fn set_has_key(&mut self, has_key: bool) {
        self.has_key = has_key;
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_disconnect_transitions() {
        let mut dev = Device::new("aa11", "Acme", "Dock");
        assert_eq!(dev.status(), Status::Disconnected);
        assert!(!dev.is_connected());

        dev.connected("/sys/bus/thunderbolt/devices/0-1", SecurityLevel::User);
        assert_eq!(dev.status(), Status::Connected);
        assert!(dev.is_connected());
        assert!(dev.syspath().is_some());
        assert_eq!(dev.security_level(), SecurityLevel::User);

        dev.disconnected();
        assert_eq!(dev.status(), Status::Disconnected);
        assert!(dev.syspath().is_none());
    }

    #[test]
    fn reconnect_after_authorized_requires_reauthorization() {
        let mut dev = Device::new("aa11", "Acme", "Dock");
        dev.connected("/sys/0-1", SecurityLevel::Secure);
        dev.set_status(Status::Authorized);

        dev.disconnected();
        dev.connected("/sys/0-3", SecurityLevel::Secure);
        // no cached shortcut: back to Connected, protocol must run again
        assert_eq!(dev.status(), Status::Connected);
        assert_eq!(dev.syspath().unwrap().to_str(), Some("/sys/0-3"));
    }

    #[test]
    fn security_level_round_trips_through_strings() {
        for level in [
            SecurityLevel::None,
            SecurityLevel::User,
            SecurityLevel::Secure,
            SecurityLevel::DpOnly,
        ] {
            let parsed: SecurityLevel = level.to_string().parse().expect("parse");
            assert_eq!(parsed, level);
        }
        assert!("legacy".parse::<SecurityLevel>().is_err());
    }

    #[test]
    fn policy_round_trips_through_strings() {
        for policy in [Policy::Manual, Policy::Auto] {
            let parsed: Policy = policy.to_string().parse().expect("parse");
            assert_eq!(parsed, policy);
        }
    }
}
