use std::env;
use std::process::{self, Stdio};
use std::sync::OnceLock;

use anyhow::anyhow;
use clap::{arg, command, ArgAction};
use execute::Execute;
use fork::{fork, Fork};
use fuser::MountOption;
use log::*;
use nix::sys::signal;
use retry::delay::Fixed;
use retry::{retry_with_index, OperationResult};

use cryptfs::block_dev::FileBlockDev;
use cryptfs::desc::PHYSICAL_BLOCK_SIZE;
use cryptfs::fuse::FuseBridge;
use cryptfs::utils::init_logs;
use cryptfs::{CryptFS, MountOptions};

/// Kept for the SIGINT handler, which cannot carry state.
static MOUNT_POINT: OnceLock<String> = OnceLock::new();

const PASSPHRASE_ENV: &str = "CRYPTFS_PASSPHRASE";

fn main() {
    process::exit(run());
}

fn umount_current() {
    if let Some(mountpoint) = MOUNT_POINT.get() {
        info!("Unmounting {}", mountpoint);
        let mut command = execute::command_args!("fusermount", "-u", mountpoint);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        match command.execute_output() {
            Ok(output) => {
                let text = String::from_utf8_lossy(&output.stdout);
                if !text.trim().is_empty() {
                    info!("fusermount: {}", text.trim());
                }
            }
            Err(e) => warn!("fusermount failed: {}", e),
        }
    }
}

pub extern "C" fn signal_handler(_: i32) {
    umount_current();
    process::exit(0);
}

fn run() -> i32 {
    let matches = command!()
        .arg(arg!([mountpoint] "Mountpoint for the decrypted view").required(true))
        .arg(
            arg!(-d --device <FILE> "Backing store holding the encrypted volume")
                .required(false)
                .default_value("cryptfs.img"),
        )
        .arg(
            arg!(-p --passphrase <PASS> "Volume passphrase (or set CRYPTFS_PASSPHRASE)")
                .required(false),
        )
        .arg(
            arg!(-o --option <OPT> "Mount option, key[=value]")
                .required(false)
                .action(ArgAction::Append),
        )
        .arg(arg!(--format "Create a fresh volume on the device first").action(ArgAction::SetTrue))
        .arg(
            arg!(--size <MIB> "Initial device size in MiB when formatting")
                .required(false)
                .default_value("64"),
        )
        .arg(arg!(-f --front "Keep the daemon in the foreground").action(ArgAction::SetTrue))
        .arg(arg!(-r --read_only "Mount read-only").action(ArgAction::SetTrue))
        .arg(
            arg!(-v --verbose "Print debug information, or set RUST_LOG=debug")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    if matches.get_flag("verbose") {
        env::set_var("RUST_LOG", "debug");
    }
    init_logs();

    let mountpoint = matches.get_one::<String>("mountpoint").expect("required");
    let device = matches.get_one::<String>("device").expect("defaulted");
    let raw_opts: Vec<String> = matches
        .get_many::<String>("option")
        .map(|vals| vals.cloned().collect())
        .unwrap_or_default();

    let passphrase = match matches
        .get_one::<String>("passphrase")
        .cloned()
        .or_else(|| env::var(PASSPHRASE_ENV).ok())
    {
        Some(p) => p,
        None => {
            error!("no passphrase given (use --passphrase or {})", PASSPHRASE_ENV);
            return 1;
        }
    };

    let mut opts = match MountOptions::parse(passphrase, &raw_opts) {
        Ok(o) => o,
        Err(e) => {
            error!("bad mount options: {}", e);
            return 1;
        }
    };
    if matches.get_flag("read_only") {
        opts.read_only = true;
    }

    MOUNT_POINT.set(mountpoint.clone()).ok();
    info!("Device: {}", device);

    if matches.get_flag("format") {
        let size_mib: u64 = match matches.get_one::<String>("size").expect("defaulted").parse() {
            Ok(v) => v,
            Err(_) => {
                error!("--size must be a number of MiB");
                return 1;
            }
        };
        let dev = match FileBlockDev::create_sized(device, size_mib * 1024 * 1024) {
            Ok(d) => d,
            Err(e) => {
                error!("cannot create {}: {}", device, e);
                return 3;
            }
        };
        match CryptFS::create(dev, &opts) {
            Ok(vol) => {
                if let Err(e) = vol.close() {
                    error!("formatting {} failed: {}", device, e);
                    return e.exit_code();
                }
                info!("Formatted {} ({} MiB)", device, size_mib);
            }
            Err(e) => {
                error!("formatting {} failed: {}", device, e);
                return e.exit_code();
            }
        }
    }

    let dev = match FileBlockDev::open(device) {
        Ok(d) => d,
        Err(e) => {
            error!("cannot open {}: {}", device, e);
            return 3;
        }
    };
    // authoritative passphrase / corruption check before daemonizing, so
    // the exit code lands on the controlling terminal
    match CryptFS::open(dev, &opts) {
        Ok(volume) => drop(volume),
        Err(e) => {
            error!("cannot open volume: {}", e);
            return e.exit_code();
        }
    }
    debug!(
        "volume verified, physical block size {}, cache {} pages",
        PHYSICAL_BLOCK_SIZE, opts.cache_capacity
    );

    let sig_action = signal::SigAction::new(
        signal::SigHandler::Handler(signal_handler),
        signal::SaFlags::SA_NODEFER,
        signal::SigSet::empty(),
    );
    if let Err(e) = unsafe { signal::sigaction(signal::Signal::SIGINT, &sig_action) } {
        warn!("SIGINT handler not installed: {:?}", e);
    }

    let mut mount_opts = vec![MountOption::FSName("cryptfs".to_string())];
    mount_opts.push(if opts.read_only {
        MountOption::RO
    } else {
        MountOption::RW
    });
    if opts.allow_other {
        mount_opts.push(MountOption::AllowOther);
    }

    let front = matches.get_flag("front");
    match if front { Ok(Fork::Child) } else { fork() } {
        Ok(Fork::Parent(child)) => {
            info!("Daemon running at pid: {}", child);
            0
        }
        Ok(Fork::Child) => {
            let retry_times: u64 = 3;
            let mounted = retry_with_index(Fixed::from_millis(100), |current_try| {
                info!("[try {}/{}] Mount to {}", current_try, retry_times, mountpoint);
                let dev = match FileBlockDev::open(device) {
                    Ok(d) => d,
                    Err(e) => return OperationResult::Err(anyhow!("cannot open {}: {}", device, e)),
                };
                let volume = match CryptFS::open(dev, &opts) {
                    Ok(v) => v,
                    Err(e) => return OperationResult::Err(anyhow!("cannot open volume: {}", e)),
                };
                match fuser::mount2(FuseBridge::new(volume), mountpoint, &mount_opts) {
                    Ok(_) => {
                        info!("All done.");
                        OperationResult::Ok(())
                    }
                    Err(e) if current_try >= retry_times => {
                        OperationResult::Err(anyhow!("mount failed after retries: {}", e))
                    }
                    Err(e) => {
                        warn!("mount failed ({}), unmounting stale mount", e);
                        umount_current();
                        OperationResult::Retry(anyhow!("mount attempt {} failed", current_try))
                    }
                }
            });
            match mounted {
                Ok(_) => 0,
                Err(e) => {
                    error!("{:?}", e);
                    3
                }
            }
        }
        Err(e) => {
            error!("fork returned error {}", e);
            1
        }
    }
}
