//! Entry point: parses arguments, scans the package store, starts the control service, mounts
//! the filesystem, and waits for the kernel to detach the mount (§5, §6).

use std::path::{Path, PathBuf};
use std::process::{self, Command};
use std::sync::Arc;

use clap::Parser;
use fuser::MountOption;
use nix::sys::signal::{pthread_sigmask, sigwait, SigSet, SigmaskHow, Signal};
use tracing::{error, info, warn};

use distrifs::config::Args;
use distrifs::control::{self, ControlService, ScanConfig};
use distrifs::frontend::Frontend;
use distrifs::namespace::Namespace;
use distrifs::{libc_loader, scanner};

fn main() {
    // Block every signal this process reacts to on the main thread *before* any other thread
    // exists, so the mask is inherited everywhere: exactly one thread (the one spawned in
    // `spawn_signal_thread`, via `sigwait`) ever observes them, instead of an async-signal-unsafe
    // default handler running on whichever thread the kernel happens to deliver to.
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGHUP);
    mask.add(Signal::SIGUSR1);
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    if let Err(e) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), None) {
        eprintln!("failed to block signals: {e}");
        process::exit(1);
    }

    tracing_subscriber::fmt::init();

    let args = Args::parse();
    if let Err(e) = run(args, mask) {
        error!(error = %e, "fatal startup error");
        process::exit(1);
    }
}

fn run(args: Args, signal_mask: SigSet) -> distrifs::Result<()> {
    let exchange_dirs = args.exchange_dirs();
    let namespace = Arc::new(Namespace::new());
    let frontend = Frontend::new(namespace.clone(), args.repo.clone());

    let socket_path = control_socket_path();
    namespace.install_ctl_symlink(&socket_path);

    info!(repo = %args.repo.display(), "scanning package store");
    let scanned = scanner::scan_all(
        &namespace,
        &frontend,
        &args.repo,
        &exchange_dirs,
        args.pkgs.as_deref(),
    )?;
    info!(scanned, "initial scan complete");
    libc_loader::maybe_install(
        &namespace,
        &args.libc_pkg,
        &args.libc_loader_path,
        &exchange_dirs,
    )?;

    let control = Arc::new(ControlService::new(
        namespace.clone(),
        frontend.clone(),
        ScanConfig {
            repo: args.repo.clone(),
            exchange_dirs: exchange_dirs.clone(),
            libc_pkg: args.libc_pkg.clone(),
            libc_loader_path: args.libc_loader_path.clone(),
        },
    ));
    {
        let control = control.clone();
        let socket_path = socket_path.clone();
        std::thread::spawn(move || {
            if let Err(e) = control.serve(&socket_path) {
                error!(error = %e, "control service exited");
            }
        });
    }

    let options = [
        MountOption::RO,
        MountOption::FSName("distri".to_string()),
        MountOption::AllowOther,
        MountOption::Suid,
    ];
    let session = fuser::spawn_mount2(frontend, &args.mountpoint, &options)
        .map_err(|e| distrifs::Error::Control(format!("mount failed: {e}")))?;
    info!(mountpoint = %args.mountpoint.display(), "mounted");

    if let Some(fd) = args.readiness {
        close_readiness_fd(fd);
    }

    spawn_signal_thread(signal_mask, socket_path, args.mountpoint.clone());

    session.join();
    info!("unmounted, exiting");
    Ok(())
}

/// A process-unique socket path under the system temp directory; reinstalled fresh on every
/// start, so a stale socket from a previous run never lingers under a reused name.
fn control_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("distrifs-{}.sock", process::id()))
}

fn close_readiness_fd(fd: i32) {
    // Safety: `fd` was handed to us by a supervising process expressly for us to close to
    // signal readiness; it is not otherwise used by this process.
    if unsafe { libc::close(fd) } != 0 {
        warn!(fd, error = %std::io::Error::last_os_error(), "failed to close readiness fd");
    }
}

/// Blocks on `sigwait` for the signals blocked in `main`, dispatching:
/// - `SIGHUP` rescans the store by issuing the same `ScanPackages` request an external control
///   client would (§5).
/// - `SIGUSR1` is reserved for remote-store reconciliation, out of scope here; logged and
///   otherwise ignored.
/// - `SIGINT`/`SIGTERM` unmount by shelling out to `fusermount -u`, which causes `join()` on the
///   `BackgroundSession` back in `run` to return and the process to exit cleanly.
fn spawn_signal_thread(mask: SigSet, socket_path: PathBuf, mountpoint: PathBuf) {
    std::thread::spawn(move || loop {
        let signal = match sigwait(&mask) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "sigwait failed");
                continue;
            }
        };
        match signal {
            Signal::SIGHUP => {
                info!("SIGHUP received, rescanning store");
                if let Err(e) = control::request(&socket_path, r#"{"op":"scan_packages"}"#) {
                    warn!(error = %e, "rescan via SIGHUP failed");
                }
            }
            Signal::SIGUSR1 => {
                info!("SIGUSR1 received (remote-store reconciliation hook, no-op here)");
            }
            Signal::SIGINT | Signal::SIGTERM => {
                info!(mountpoint = %mountpoint.display(), "shutdown signal received, unmounting");
                match Command::new("fusermount").arg("-u").arg(&mountpoint).status() {
                    Ok(status) if !status.success() => {
                        warn!(?status, "fusermount -u exited non-zero")
                    }
                    Err(e) => warn!(error = %e, "failed to spawn fusermount"),
                    Ok(_) => {}
                }
                return;
            }
            _ => {}
        }
    });
}
