//! The authorization protocol: identity verification, key provisioning
//! and the `authorized` grant.
//!
//! Everything here runs as a sequence of blocking syscalls against one
//! held attribute directory descriptor. The engine aborts at the first
//! failure and never undoes a partially written key; a key-without-grant
//! state on the device is accepted and logged, not corrected.

use crate::device::{Device, SecurityLevel, Status};
use crate::sysfs::{AttrDir, AttrMode};
use crate::{AuthError, Context};

/// Grant code for a user-level (identity-only) authorization.
pub const AUTH_CODE_USER: u8 = b'1';
/// Grant code for a secure (key-verified) authorization.
pub const AUTH_CODE_SECURE: u8 = b'2';

/// The on-wire grant byte for a security level.
///
/// `None` and `DpOnly` have no grant byte: there is nothing the engine
/// can or needs to write for them. The level and the code byte are kept
/// as distinct types on purpose; the only place they meet is here.
pub fn grant_code(level: SecurityLevel) -> Option<u8> {
    match level {
        SecurityLevel::None | SecurityLevel::DpOnly => None,
        SecurityLevel::User => Some(AUTH_CODE_USER),
        SecurityLevel::Secure => Some(AUTH_CODE_SECURE),
    }
}

/// Authorize `device` against its live attribute directory.
///
/// For a device whose level requires no authorization this is a
/// successful no-op with no attribute I/O at all. Otherwise the status
/// moves `Authorizing -> Authorized` on success or `-> AuthError` on the
/// first failure, which is returned as-is.
pub fn authorize(ctx: &mut Context, device: &mut Device) -> Result<(), AuthError> {
    let level = device.security_level();
    let Some(code) = grant_code(level) else {
        // nothing to do, the device is already usable
        return Ok(());
    };

    device.set_status(Status::Authorizing);
    match run_protocol(ctx, device, level, code) {
        Ok(()) => {
            device.set_status(Status::Authorized);
            log::info!("authorized device {} at level {level}", device.uid());
            Ok(())
        }
        Err(err) => {
            device.set_status(Status::AuthError);
            Err(err)
        }
    }
}

fn run_protocol(
    ctx: &mut Context,
    device: &mut Device,
    level: SecurityLevel,
    mut code: u8,
) -> Result<(), AuthError> {
    let syspath = device
        .syspath()
        .ok_or_else(|| AuthError::NotFound(device.uid().to_string()))?
        .to_path_buf();
    let uid = device.uid().to_string();

    // The directory descriptor is held for the whole attempt; every
    // attribute open below is relative to it.
    let dir = AttrDir::open(&syspath)?;

    verify_uid(&dir, &uid)?;

    let mut key_written = false;
    if level == SecurityLevel::Secure {
        let created = provision_key(ctx, &dir, &uid)?;
        device.set_has_key(true);
        key_written = true;
        if created {
            // The device has not yet confirmed a freshly generated key,
            // so only a provisional user-level grant is issued; the next
            // authorization of this uid gets the full secure code.
            log::info!("new key provisioned for {uid}, issuing provisional grant");
            code = AUTH_CODE_USER;
        }
    }

    write_grant(&dir, code).map_err(|err| {
        if key_written {
            log::warn!(
                "device {uid} left with key written but no grant: {err}; \
                 a later authorization attempt will rewrite both"
            );
        }
        err
    })
}

/// Compare the live `unique_id` attribute byte-for-byte against the uid
/// we were asked to authorize.
///
/// This is the authoritative guard against a directory-path race: the
/// directory found at a remembered path might by now belong to a
/// different, re-enumerated device. Short reads count as mismatches.
fn verify_uid(dir: &AttrDir, uid: &str) -> Result<(), AuthError> {
    let mut attr = dir.open_attr("unique_id", AttrMode::ReadOnly)?;
    let found = attr.read_up_to(uid.len())?;
    if found != uid.as_bytes() {
        let found = String::from_utf8_lossy(&found).into_owned();
        log::warn!("security: unique_id mismatch, expected {uid}, device reports {found:?}");
        return Err(AuthError::Verification {
            expected: uid.to_string(),
            found,
        });
    }
    Ok(())
}

/// Fetch (or create) the key for `uid` and write it to the device's
/// `key` attribute in one atomic write. Returns whether the key was
/// created in this attempt.
///
/// Any failure here aborts the protocol before the grant is written; a
/// partially provisioned key must never be followed by a grant.
fn provision_key(ctx: &mut Context, dir: &AttrDir, uid: &str) -> Result<bool, AuthError> {
    let (key, created) = ctx.keystore_mut().ensure_key(uid, false)?;
    let mut attr = dir.open_attr("key", AttrMode::WriteOnly)?;
    attr.write_all(key.hex_bytes())?;
    attr.close()?;
    Ok(created)
}

fn write_grant(dir: &AttrDir, code: u8) -> Result<(), AuthError> {
    let mut attr = dir.open_attr("authorized", AttrMode::WriteOnly)?;
    attr.write_byte(code)?;
    attr.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::{KeyStore, KEY_CHARS};
    use crate::registry::InMemoryDeviceStore;
    use std::fs;
    use std::path::Path;

    const UID: &str = "aa11";

    fn test_context(root: &Path) -> Context {
        let keystore = KeyStore::open(root.join("keys")).expect("keystore");
        Context::new(
            SecurityLevel::Secure,
            keystore,
            Box::new(InMemoryDeviceStore::new()),
        )
    }

    /// Lay out a fake attribute directory the way the kernel would.
    fn fake_attr_dir(root: &Path, unique_id: &str) -> std::path::PathBuf {
        let dir = root.join("0-1");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("unique_id"), unique_id).expect("unique_id");
        fs::write(dir.join("key"), b"").expect("key");
        fs::write(dir.join("authorized"), b"").expect("authorized");
        dir
    }

    fn connected_device(dir: &Path, level: SecurityLevel) -> Device {
        let mut dev = Device::new(UID, "Acme", "Dock");
        dev.connected(dir, level);
        dev
    }

    #[test]
    fn level_none_is_a_no_op_without_io() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut ctx = test_context(tmp.path());
        let mut dev = Device::new(UID, "Acme", "Dock");
        // no syspath at all: any attribute I/O would fail, so success
        // proves none was attempted
        dev.connected(tmp.path().join("nonexistent"), SecurityLevel::None);
        authorize(&mut ctx, &mut dev).expect("no-op");
        assert_eq!(dev.status(), Status::Connected);
    }

    #[test]
    fn dponly_is_treated_like_none() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut ctx = test_context(tmp.path());
        let mut dev = connected_device(&tmp.path().join("nonexistent"), SecurityLevel::DpOnly);
        authorize(&mut ctx, &mut dev).expect("no-op");
        assert_eq!(dev.status(), Status::Connected);
    }

    #[test]
    fn user_level_writes_the_user_grant_byte() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = fake_attr_dir(tmp.path(), UID);
        let mut ctx = test_context(tmp.path());
        let mut dev = connected_device(&dir, SecurityLevel::User);

        authorize(&mut ctx, &mut dev).expect("authorize");
        assert_eq!(dev.status(), Status::Authorized);
        assert_eq!(fs::read(dir.join("authorized")).expect("read"), b"1");
        assert_eq!(fs::read(dir.join("key")).expect("read"), b"");
    }

    #[test]
    fn uid_mismatch_fails_verification_and_writes_nothing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = fake_attr_dir(tmp.path(), "bb22");
        let mut ctx = test_context(tmp.path());
        let mut dev = connected_device(&dir, SecurityLevel::User);

        let err = authorize(&mut ctx, &mut dev).expect_err("must fail");
        match err {
            AuthError::Verification { expected, found } => {
                assert_eq!(expected, UID);
                assert_eq!(found, "bb22");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(dev.status(), Status::AuthError);
        assert_eq!(fs::read(dir.join("authorized")).expect("read"), b"");
        assert_eq!(fs::read(dir.join("key")).expect("read"), b"");
    }

    #[test]
    fn short_unique_id_counts_as_mismatch() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = fake_attr_dir(tmp.path(), "aa"); // truncated
        let mut ctx = test_context(tmp.path());
        let mut dev = connected_device(&dir, SecurityLevel::User);

        let err = authorize(&mut ctx, &mut dev).expect_err("must fail");
        assert!(matches!(err, AuthError::Verification { .. }), "got {err}");
        assert_eq!(fs::read(dir.join("authorized")).expect("read"), b"");
    }

    #[test]
    fn secure_first_authorization_downgrades_to_user_grant() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = fake_attr_dir(tmp.path(), UID);
        let mut ctx = test_context(tmp.path());
        let mut dev = connected_device(&dir, SecurityLevel::Secure);

        authorize(&mut ctx, &mut dev).expect("authorize");
        assert_eq!(dev.status(), Status::Authorized);
        assert!(dev.has_key());

        // fresh key: provisional user-level grant only
        assert_eq!(fs::read(dir.join("authorized")).expect("read"), b"1");
        let written = fs::read(dir.join("key")).expect("read");
        assert_eq!(written.len(), KEY_CHARS);
        assert!(written.iter().all(u8::is_ascii_hexdigit));
    }

    #[test]
    fn secure_second_authorization_uses_the_secure_grant() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = fake_attr_dir(tmp.path(), UID);
        let mut ctx = test_context(tmp.path());
        let mut dev = connected_device(&dir, SecurityLevel::Secure);

        authorize(&mut ctx, &mut dev).expect("first");
        let first_key = fs::read(dir.join("key")).expect("read");

        // simulate reconnect and a second attempt with the key on file
        dev.disconnected();
        dev.connected(&dir, SecurityLevel::Secure);
        authorize(&mut ctx, &mut dev).expect("second");

        assert_eq!(fs::read(dir.join("authorized")).expect("read"), b"2");
        // same uid, same key
        assert_eq!(fs::read(dir.join("key")).expect("read"), first_key);
    }

    #[test]
    fn missing_device_directory_is_not_found() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut ctx = test_context(tmp.path());
        let mut dev = connected_device(&tmp.path().join("0-9"), SecurityLevel::User);

        let err = authorize(&mut ctx, &mut dev).expect_err("must fail");
        assert!(matches!(err, AuthError::NotFound(_)), "got {err}");
        assert_eq!(dev.status(), Status::AuthError);
    }

    #[test]
    fn disconnected_device_is_not_found() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut ctx = test_context(tmp.path());
        let mut dev = Device::new(UID, "Acme", "Dock");
        dev.connected(tmp.path(), SecurityLevel::User);
        dev.disconnected();

        let err = authorize(&mut ctx, &mut dev).expect_err("must fail");
        assert!(matches!(err, AuthError::NotFound(_)), "got {err}");
    }

    #[test]
    fn key_write_failure_aborts_before_the_grant() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("0-1");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("unique_id"), UID).expect("unique_id");
        // no `key` attribute: the write-only open fails with ENOENT
        fs::write(dir.join("authorized"), b"").expect("authorized");

        let mut ctx = test_context(tmp.path());
        let mut dev = connected_device(&dir, SecurityLevel::Secure);

        let err = authorize(&mut ctx, &mut dev).expect_err("must fail");
        match err {
            AuthError::Io { attr, .. } => assert_eq!(attr, "key"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(dev.status(), Status::AuthError);
        // the grant was never written
        assert_eq!(fs::read(dir.join("authorized")).expect("read"), b"");
        // but the key store did its part and stays consistent
        assert!(ctx.keystore_mut().has_key(UID));
    }

    #[test]
    fn grant_codes_map_levels_to_wire_bytes() {
        assert_eq!(grant_code(SecurityLevel::None), None);
        assert_eq!(grant_code(SecurityLevel::DpOnly), None);
        assert_eq!(grant_code(SecurityLevel::User), Some(b'1'));
        assert_eq!(grant_code(SecurityLevel::Secure), Some(b'2'));
    }
}
