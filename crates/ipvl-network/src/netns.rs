//! Network namespace operations.
//!
//! Network namespace membership is a property of the calling OS thread, not
//! of the process. A thread that enters a namespace must also be the thread
//! that leaves it, and netlink sockets are bound to whatever namespace their
//! creating thread was in at the time.
//!
//! The plugin therefore pins a single worker thread at startup with
//! [`pin_current_thread`]. Only a [`ThreadSwitch`] built from that pin can
//! enter a namespace, and it refuses to do so from any other thread.

use std::fs::File;
use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::thread::{self, ThreadId};

use ipvl_common::{IpvlError, IpvlResult};
use once_cell::sync::OnceCell;
use rustix::thread::{LinkNameSpaceType, move_into_link_name_space};

/// Path of the calling thread's own network namespace.
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

static PINNED_THREAD: OnceCell<ThreadId> = OnceCell::new();

/// An open handle to a network namespace.
///
/// The namespace stays referenced for as long as the handle lives; dropping
/// it closes the descriptor.
#[derive(Debug)]
pub struct NetNamespace {
    path: PathBuf,
    fd: OwnedFd,
}

impl NetNamespace {
    /// Open the namespace bind-mounted (or proc-linked) at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`IpvlError::Open`] if the path cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> IpvlResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| IpvlError::Open {
            path: path.display().to_string(),
            source,
        })?;

        tracing::debug!(path = %path.display(), "Opened network namespace");
        Ok(Self {
            path: path.to_path_buf(),
            fd: file.into(),
        })
    }

    /// Open the calling thread's current network namespace.
    ///
    /// # Errors
    ///
    /// Returns [`IpvlError::Open`] if procfs is unavailable.
    pub fn current() -> IpvlResult<Self> {
        Self::open(THREAD_NETNS)
    }

    /// The path this namespace was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn enter(&self) -> IpvlResult<()> {
        move_into_link_name_space(self.fd.as_fd(), Some(LinkNameSpaceType::Network)).map_err(
            |e| IpvlError::namespace(format!("setns to {}: {e}", self.path.display())),
        )
    }
}

impl AsFd for NetNamespace {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for NetNamespace {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Proof that the calling thread is the process's namespace worker.
///
/// Not `Send`: the token cannot leave the thread it was created on.
#[derive(Debug)]
pub struct PinnedThread {
    id: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl PinnedThread {
    /// Whether the calling thread is the pinned worker.
    #[must_use]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.id
    }
}

/// Pin the calling thread as the process's namespace worker.
///
/// The first call fixes the worker for the rest of the process lifetime.
/// Later calls from the same thread hand out another token.
///
/// # Errors
///
/// Returns [`IpvlError::Namespace`] when called from any other thread.
pub fn pin_current_thread() -> IpvlResult<PinnedThread> {
    let current = thread::current().id();
    let pinned = *PINNED_THREAD.get_or_init(|| current);
    if pinned != current {
        return Err(IpvlError::namespace(format!(
            "namespace worker is pinned to {pinned:?}, called from {current:?}"
        )));
    }

    tracing::debug!(thread = ?current, "Pinned namespace worker thread");
    Ok(PinnedThread {
        id: current,
        _not_send: PhantomData,
    })
}

/// Enters a namespace for the duration of a guard.
pub trait NamespaceSwitch {
    /// Restores the previous namespace when released.
    type Guard: NamespaceGuard;

    /// Move the calling thread into `target`.
    ///
    /// # Errors
    ///
    /// Returns [`IpvlError::Namespace`] if the switch is refused or fails.
    fn enter(&self, target: &NetNamespace) -> IpvlResult<Self::Guard>;
}

/// Scope of a namespace switch.
pub trait NamespaceGuard {
    /// Return to the namespace the thread was in before entering.
    ///
    /// # Errors
    ///
    /// Returns [`IpvlError::Namespace`] if the thread could not switch back.
    fn exit(self) -> IpvlResult<()>;
}

/// Switches the pinned worker thread between namespaces with `setns(2)`.
#[derive(Debug)]
pub struct ThreadSwitch {
    pin: PinnedThread,
}

impl ThreadSwitch {
    /// Create a switch bound to the pinned worker.
    #[must_use]
    pub const fn new(pin: PinnedThread) -> Self {
        Self { pin }
    }
}

impl NamespaceSwitch for ThreadSwitch {
    type Guard = NetnsGuard;

    fn enter(&self, target: &NetNamespace) -> IpvlResult<NetnsGuard> {
        if !self.pin.is_current() {
            return Err(IpvlError::namespace(
                "namespace switch attempted off the pinned worker thread",
            ));
        }
        NetnsGuard::enter(target)
    }
}

/// Keeps the calling thread inside a namespace until exited or dropped.
#[derive(Debug)]
pub struct NetnsGuard {
    host: Option<NetNamespace>,
    _not_send: PhantomData<*const ()>,
}

impl NetnsGuard {
    fn enter(target: &NetNamespace) -> IpvlResult<Self> {
        let host = NetNamespace::current()?;
        target.enter()?;

        tracing::debug!(netns = %target.path().display(), "Entered network namespace");
        Ok(Self {
            host: Some(host),
            _not_send: PhantomData,
        })
    }

    fn restore(&mut self) -> IpvlResult<()> {
        match self.host.take() {
            Some(host) => {
                host.enter()?;
                tracing::debug!("Returned to host network namespace");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl NamespaceGuard for NetnsGuard {
    fn exit(mut self) -> IpvlResult<()> {
        self.restore()
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            tracing::error!(error = %e, "Failed to return to host network namespace");
        }
    }
}
