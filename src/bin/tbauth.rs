//! tbauth - authorize Thunderbolt devices from the command line.
//!
//! Thin glue over the authorization engine: argument parsing, the root
//! check, and the sysfs scan that turns a uid into a live device path.
//! Discovery proper (hotplug) is the udev daemon's business, not ours.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, bail, Context as _, Result};
use clap::{Parser, Subcommand};

use tbauth::sysfs::{self, AttrDir};
use tbauth::{auth, policy, Context, Device, Policy, SecurityLevel, TbauthConfig};

#[derive(Parser)]
#[command(name = "tbauth", version, about = "Authorize thunderbolt devices")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Authorize a specific thunderbolt device
    Authorize {
        /// Device uid, as reported by its unique_id attribute
        uid: String,
        /// Persist the device in the registry
        #[arg(long)]
        store: bool,
        /// Set policy to auto-authorize on future connects (implies --store)
        #[arg(long)]
        auto: bool,
    },
    /// Authorize a device only if its stored policy allows it
    Auto {
        /// Device uid
        uid: String,
    },
    /// Remove a device from the registry and discard its key
    Forget {
        /// Device uid
        uid: String,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("tbauth: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    require_root()?;

    let cfg = TbauthConfig::load()?;
    let mut ctx = Context::from_config(&cfg).context("open key store and registry")?;

    match cli.command {
        Command::Authorize { uid, store, auto } => cmd_authorize(&cfg, &mut ctx, &uid, store, auto),
        Command::Auto { uid } => cmd_auto(&cfg, &mut ctx, &uid),
        Command::Forget { uid } => cmd_forget(&mut ctx, &uid),
    }
}

/// Writing to the security attributes requires real root, not just an
/// effective uid.
fn require_root() -> Result<()> {
    let uid = unsafe { libc::getuid() };
    let euid = unsafe { libc::geteuid() };
    if uid != 0 || euid != 0 {
        bail!("root permissions are required to authorize devices");
    }
    Ok(())
}

fn cmd_authorize(
    cfg: &TbauthConfig,
    ctx: &mut Context,
    uid: &str,
    store: bool,
    auto: bool,
) -> Result<()> {
    let mut device = lookup_device(cfg, ctx, uid)?;

    auth::authorize(ctx, &mut device).map_err(|err| match err.os_code() {
        Some(code) => anyhow!("could not authorize device {uid}: {err} [{code}]"),
        None => anyhow!("could not authorize device {uid}: {err}"),
    })?;

    if auto {
        device.set_policy(Policy::Auto);
    }
    if store || auto {
        ctx.registry_mut()
            .store(&device)
            .map_err(|err| anyhow!("could not store device in registry: {err}"))?;
    }

    println!("{uid} {}", device.status());
    Ok(())
}

fn cmd_auto(cfg: &TbauthConfig, ctx: &mut Context, uid: &str) -> Result<()> {
    let Some(stored) = ctx
        .registry_mut()
        .lookup(uid)
        .map_err(|err| anyhow!("registry lookup failed: {err}"))?
    else {
        println!("thunderbolt device {uid} not in store");
        return Ok(());
    };
    let mut device = stored.to_device();

    if !policy::should_auto_authorize(ctx.registry_mut(), &device)
        .map_err(|err| anyhow!("policy check failed: {err}"))?
    {
        println!("thunderbolt device {uid} not set up for auto authorization");
        return Ok(());
    }

    attach_live_state(cfg, ctx, &mut device)?;

    auth::authorize(ctx, &mut device).map_err(|err| match err.os_code() {
        Some(code) => anyhow!("could not authorize device {uid}: {err} [{code}]"),
        None => anyhow!("could not authorize device {uid}: {err}"),
    })?;

    println!("{uid} {}", device.status());
    Ok(())
}

fn cmd_forget(ctx: &mut Context, uid: &str) -> Result<()> {
    let had_record = ctx
        .registry_mut()
        .forget(uid)
        .map_err(|err| anyhow!("could not forget device: {err}"))?;
    let had_key = ctx
        .keystore_mut()
        .forget_key(uid)
        .map_err(|err| anyhow!("could not discard key: {err}"))?;

    if !had_record && !had_key {
        bail!("device {uid} is not known");
    }
    println!("forgot {uid}");
    Ok(())
}

/// Build the device record for `uid`: stored slice if the registry knows
/// it, then the live sysfs state.
fn lookup_device(cfg: &TbauthConfig, ctx: &mut Context, uid: &str) -> Result<Device> {
    let mut device = match ctx
        .registry_mut()
        .lookup(uid)
        .map_err(|err| anyhow!("registry lookup failed: {err}"))?
    {
        Some(stored) => stored.to_device(),
        None => Device::new(uid, "", ""),
    };
    attach_live_state(cfg, ctx, &mut device)?;
    Ok(device)
}

fn attach_live_state(cfg: &TbauthConfig, ctx: &Context, device: &mut Device) -> Result<()> {
    let (syspath, level) = find_connected(&cfg.sysfs_base, device.uid(), ctx.security_level())?
        .ok_or_else(|| anyhow!("could not find device {}", device.uid()))?;
    device.connected(syspath, level);
    Ok(())
}

/// Scan the sysfs base directory for the device whose `unique_id`
/// matches. The level comes from the device's `security` attribute when
/// present, otherwise from the configured floor.
fn find_connected(
    base: &Path,
    uid: &str,
    floor: SecurityLevel,
) -> Result<Option<(PathBuf, SecurityLevel)>> {
    let entries = std::fs::read_dir(base)
        .map_err(|e| anyhow!("cannot read {}: {e}", base.display()))?;

    for entry in entries {
        let path = entry?.path();
        let Ok(dir) = AttrDir::open(&path) else {
            continue;
        };
        let Ok(found) = sysfs::read_attr_string(&dir, "unique_id") else {
            // not a device directory (e.g. a domain or host controller)
            continue;
        };
        if found != uid {
            continue;
        }
        let level = sysfs::read_attr_string(&dir, "security")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(floor);
        return Ok(Some((path, level)));
    }
    Ok(None)
}
