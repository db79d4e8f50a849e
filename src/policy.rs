//! Policy check for the automatic (non-interactive) authorization path.
//!
//! The interactive path deliberately bypasses this: an explicit
//! `authorize` request is itself the authorization decision.

use crate::device::{Device, Policy};
use crate::registry::DeviceStore;
use crate::AuthError;

/// Whether policy permits authorizing `device` without operator
/// interaction: the device must be known to the registry and its stored
/// policy must be `Auto`. Security level plays no part here.
pub fn should_auto_authorize(
    store: &mut dyn DeviceStore,
    device: &Device,
) -> Result<bool, AuthError> {
    match store.lookup(device.uid())? {
        Some(stored) => Ok(stored.policy == Policy::Auto),
        None => Ok(false),
    }
}

/// Typed variant for callers that treat a declined auto-authorization as
/// an error to report (the hotplug trigger); the CLI path prints a notice
/// and exits cleanly instead.
pub fn ensure_auto_authorized(
    store: &mut dyn DeviceStore,
    device: &Device,
) -> Result<(), AuthError> {
    if should_auto_authorize(store, device)? {
        Ok(())
    } else {
        Err(AuthError::Policy(device.uid().to_string()))
    }
}
