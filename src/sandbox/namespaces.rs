//! Namespace creation, pinning, and re-entry for the kiosk sandbox.
//!
//! Namespace membership is a property of the kernel thread, not the process.
//! Rust's `std::thread` maps 1:1 onto kernel threads, so every operation that
//! changes namespace membership here happens on a thread dedicated to that
//! purpose:
//!
//! - [`NamespaceSet::create`] runs `unshare` + hostname + loopback + pivot on
//!   a fresh thread, then parks it until the supervisor has bind-mounted
//!   `/proc/<pid>/task/<tid>/ns/{uts,net,mnt}` onto pin files. Once the pins
//!   (and their open descriptors) hold the namespaces alive, the thread exits.
//! - [`NamespaceSet::enter`] makes the *calling* thread a member; the caller
//!   must own that thread for as long as it relies on membership and must
//!   never hand it back to a pool.
//! - [`NamespaceSet::run_inside`] spawns a throwaway thread per call; entered
//!   threads are never reused.
//!
//! The pin directory is made a recursive-private bind mount first so the pins
//! are invisible to host mount propagation.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, RwLock};
use std::thread;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};
use nix::unistd::{getpid, gettid, sethostname, Pid};
use tracing::{debug, instrument, trace, warn};

use crate::error::{Error, NamespaceError};
use crate::sandbox::{rootfs, SandboxConfig};

/// The namespace kinds the sandbox isolates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NsKind {
    /// Hostname isolation.
    Uts,
    /// Network stack isolation (loopback only).
    Net,
    /// Mount table isolation.
    Mnt,
}

/// All kinds, in pin order.
pub const NS_KINDS: [NsKind; 3] = [NsKind::Uts, NsKind::Net, NsKind::Mnt];

impl NsKind {
    /// The kernel's name for this kind under `/proc/<pid>/ns/`.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            NsKind::Uts => "uts",
            NsKind::Net => "net",
            NsKind::Mnt => "mnt",
        }
    }

    /// The `setns`/`unshare` flag for this kind.
    #[must_use]
    pub fn clone_flag(self) -> CloneFlags {
        match self {
            NsKind::Uts => CloneFlags::CLONE_NEWUTS,
            NsKind::Net => CloneFlags::CLONE_NEWNET,
            NsKind::Mnt => CloneFlags::CLONE_NEWNS,
        }
    }
}

impl fmt::Display for NsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One pinned namespace: a bind-mounted pin file plus an open descriptor on
/// it for fast `setns`.
#[derive(Debug)]
struct NsPin {
    kind: NsKind,
    path: PathBuf,
    file: File,
}

/// Attempts to make the pin directory private before giving up.
const PRIVATE_MOUNT_RETRIES: u32 = 8;

/// A set of pinned UTS/NET/MNT namespaces for the sandboxed workload.
///
/// The pins keep the namespaces alive after the creation thread exits.
/// Either all three kinds are pinned and valid, or the set is destroyed.
#[derive(Debug)]
pub struct NamespaceSet {
    ns_dir: PathBuf,
    pins: RwLock<Vec<NsPin>>,
}

impl NamespaceSet {
    /// Creates the sandbox namespaces and pins them under `config.ns_dir`.
    ///
    /// The critical path runs on a dedicated kernel thread: a combined
    /// `unshare(UTS|NET|MNT)`, hostname setup, loopback up, then the rootfs
    /// pivot. The thread is held alive only until the supervisor side has
    /// bind-mounted the three `/proc/<pid>/task/<tid>/ns/*` entries onto pin
    /// files and opened descriptors on them.
    ///
    /// # Errors
    ///
    /// Any failure on the create path aborts; a half-built pin directory is
    /// left behind and cleaned up by the next create or by [`destroy`].
    ///
    /// [`destroy`]: NamespaceSet::destroy
    #[instrument(skip_all, fields(hostname = %config.hostname, ns_dir = %config.ns_dir.display()))]
    pub fn create(config: &SandboxConfig) -> Result<Self, Error> {
        let thread_config = config.clone();
        let (result_tx, result_rx) = mpsc::channel::<Result<Pid, Error>>();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let creator = thread::Builder::new()
            .name(String::from("ns-create"))
            .spawn(move || {
                let outcome = create_on_thread(&thread_config).map(|()| gettid());
                if result_tx.send(outcome).is_err() {
                    return;
                }
                // The unpinned namespaces live only as long as this thread;
                // park until the supervisor has bind-mounted the pins.
                let _ = release_rx.recv();
            })
            .map_err(Error::Io)?;

        let tid = match result_rx.recv() {
            Ok(Ok(tid)) => tid,
            Ok(Err(e)) => {
                drop(release_tx);
                let _ = creator.join();
                return Err(e);
            }
            Err(_) => {
                let _ = creator.join();
                return Err(NamespaceError::CreatorDied.into());
            }
        };

        let proc_base = PathBuf::from(format!(
            "/proc/{}/task/{}/ns",
            getpid().as_raw(),
            tid.as_raw()
        ));
        debug!(proc_base = %proc_base.display(), "Namespaces created, pinning");

        let pinned = pin_namespaces(&config.ns_dir, &proc_base);

        // Pins (or the error) are final; release the creator either way.
        drop(release_tx);
        let _ = creator.join();

        let pins = pinned?;
        debug!("Namespace set pinned");

        Ok(Self {
            ns_dir: config.ns_dir.clone(),
            pins: RwLock::new(pins),
        })
    }

    /// Makes the calling thread a member of all three pinned namespaces.
    ///
    /// The thread first unshares its mount namespace so that subsequent
    /// mount activity cannot leak into the host, then `setns`s into each
    /// pinned namespace in turn.
    ///
    /// The caller must keep the thread for its remaining lifetime: namespace
    /// membership does not survive handing the work to another thread, and a
    /// partially entered thread (see `Errors`) is unsafe for any further use.
    ///
    /// # Errors
    ///
    /// Returns [`NamespaceError::Enter`] carrying every failed `setns`, or
    /// [`NamespaceError::Destroyed`] if the set is gone.
    pub fn enter(&self) -> Result<(), Error> {
        let pins = self.pins.read().map_err(|_| NamespaceError::Destroyed)?;
        if pins.is_empty() {
            return Err(NamespaceError::Destroyed.into());
        }

        unshare(CloneFlags::CLONE_NEWNS)
            .map_err(|e| NamespaceError::Unshare { source: e })?;

        let mut failures = Vec::new();
        for pin in pins.iter() {
            if let Err(e) = setns(pin.file.as_fd(), pin.kind.clone_flag()) {
                failures.push(format!("setns {}: {}", pin.kind, e));
            }
        }

        if failures.is_empty() {
            trace!("Thread entered sandbox namespaces");
            Ok(())
        } else {
            Err(NamespaceError::Enter { failures }.into())
        }
    }

    /// Runs `f` on a fresh thread that has entered the sandbox namespaces.
    ///
    /// A new kernel thread is spawned per call and discarded afterwards;
    /// entered threads are never returned to any pool.
    ///
    /// # Errors
    ///
    /// Returns the entry error, `f`'s own error, or
    /// [`NamespaceError::TaskPanicked`] if `f` panicked.
    pub fn run_inside<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> Result<T, Error> + Send,
        T: Send,
    {
        thread::scope(|scope| {
            let handle = thread::Builder::new()
                .name(String::from("ns-task"))
                .spawn_scoped(scope, || {
                    self.enter()?;
                    f()
                })
                .map_err(Error::Io)?;

            handle
                .join()
                .unwrap_or_else(|_| Err(NamespaceError::TaskPanicked.into()))
        })
    }

    /// Releases the pins: per kind, detach-unmount then remove the pin file
    /// (that order is required; the bind mount holds a reference), close the
    /// descriptor, and finally detach the pin directory itself.
    ///
    /// Idempotent; failures are logged and skipped so every pin gets a
    /// cleanup attempt.
    #[instrument(skip(self), fields(ns_dir = %self.ns_dir.display()))]
    pub fn destroy(&self) {
        let mut guard = match self.pins.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let pins = std::mem::take(&mut *guard);
        drop(guard);

        for pin in pins {
            if let Err(e) = umount2(&pin.path, MntFlags::MNT_DETACH) {
                warn!(pin = %pin.path.display(), error = %e, "Failed to unmount pin");
            }
            if let Err(e) = std::fs::remove_file(&pin.path) {
                warn!(pin = %pin.path.display(), error = %e, "Failed to remove pin file");
            }
            drop(pin.file);
        }

        if let Err(e) = umount2(&self.ns_dir, MntFlags::MNT_DETACH) {
            trace!(error = %e, "Pin directory unmount (may already be detached)");
        }

        debug!("Namespace set destroyed");
    }

    /// Directory holding the pin files.
    #[must_use]
    pub fn ns_dir(&self) -> &Path {
        &self.ns_dir
    }

    /// Whether the set still holds valid pins.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.pins.read().map(|p| p.is_empty()).unwrap_or(true)
    }
}

/// Critical path executed on the dedicated creation thread.
fn create_on_thread(config: &SandboxConfig) -> Result<(), Error> {
    unshare(CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_NEWNS)
        .map_err(|e| NamespaceError::Unshare { source: e })?;

    sethostname(&config.hostname).map_err(|e| NamespaceError::SetHostname {
        hostname: config.hostname.clone(),
        source: e,
    })?;

    loopback_up().map_err(|e| NamespaceError::LoopbackUp { source: e })?;

    rootfs::pivot_and_populate(config)?;

    Ok(())
}

/// Supervisor-side finalization: bind-mount the creator thread's namespace
/// files onto persistent pins and open descriptors on them.
fn pin_namespaces(ns_dir: &Path, proc_base: &Path) -> Result<Vec<NsPin>, Error> {
    // A stale pin directory from a previous run may still be mounted.
    let _ = umount2(ns_dir, MntFlags::MNT_DETACH);

    std::fs::create_dir_all(ns_dir).map_err(Error::Io)?;
    make_mount_private(ns_dir)?;

    let mut pins = Vec::with_capacity(NS_KINDS.len());
    for kind in NS_KINDS {
        let src = proc_base.join(kind.name());
        let dst = ns_dir.join(kind.name());

        let _ = umount2(&dst, MntFlags::MNT_DETACH);
        let _ = std::fs::remove_file(&dst);

        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o444)
            .open(&dst)
            .map_err(|e| NamespaceError::Pin {
                kind,
                path: dst.display().to_string(),
                reason: format!("create pin file: {e}"),
            })?;

        rootfs::bind_mount(&src, &dst).map_err(|e| NamespaceError::Pin {
            kind,
            path: dst.display().to_string(),
            reason: e.to_string(),
        })?;

        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&dst)
            .map_err(|e| NamespaceError::Pin {
                kind,
                path: dst.display().to_string(),
                reason: format!("open pin: {e}"),
            })?;

        trace!(%kind, pin = %dst.display(), "Namespace pinned");
        pins.push(NsPin {
            kind,
            path: dst,
            file,
        });
    }

    Ok(pins)
}

/// Makes `ns_dir` a recursive-private mount so the pins stay invisible to
/// host propagation. Hosts that inherit shared propagation from init reject
/// `MS_PRIVATE` on a plain directory, so each failed attempt first binds the
/// directory onto itself. Bounded rather than retrying forever.
fn make_mount_private(ns_dir: &Path) -> Result<(), Error> {
    for attempt in 0..PRIVATE_MOUNT_RETRIES {
        match mount(
            None::<&str>,
            ns_dir,
            Some("none"),
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            None::<&str>,
        ) {
            Ok(()) => {
                trace!(attempt, "Pin directory is private");
                return Ok(());
            }
            Err(e) => {
                trace!(attempt, error = %e, "MS_PRIVATE failed, self-binding");
                rootfs::bind_mount(ns_dir, ns_dir)?;
            }
        }
    }

    Err(NamespaceError::PinDirPrivate {
        path: ns_dir.display().to_string(),
        attempts: PRIVATE_MOUNT_RETRIES,
    }
    .into())
}

/// Brings the loopback interface up inside the freshly created net namespace.
fn loopback_up() -> std::io::Result<()> {
    // SAFETY: a plain AF_INET datagram socket used only for interface ioctls.
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if sock < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let result = (|| {
        // SAFETY: ifreq is valid zero-initialised; the name fits with its NUL.
        let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
        for (slot, byte) in req.ifr_name.iter_mut().zip(b"lo\0") {
            *slot = *byte as libc::c_char;
        }

        // SAFETY: req outlives both ioctls and matches their expected layout.
        if unsafe { libc::ioctl(sock, libc::SIOCGIFFLAGS, &mut req) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        unsafe {
            req.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;
        }
        if unsafe { libc::ioctl(sock, libc::SIOCSIFFLAGS, &req) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    })();

    // SAFETY: sock is a valid descriptor owned by this function.
    unsafe { libc::close(sock) };
    result
}
