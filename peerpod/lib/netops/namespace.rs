use std::{
    fs::{self, File},
    os::{
        fd::{AsRawFd, RawFd},
        unix::fs::MetadataExt,
    },
    path::{Path, PathBuf},
    sync::Arc,
};

use nix::{
    mount::{mount, umount2, MntFlags, MsFlags},
    sched::{setns, unshare, CloneFlags},
};
use rtnetlink::Handle;
use tracing::{debug, error};

use crate::{PeerpodError, PeerpodResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory where named network namespaces are bind-mounted.
pub const NETNS_RUN_DIR: &str = "/run/netns";

const SELF_NETNS_PATH: &str = "/proc/self/ns/net";

const THREAD_NETNS_PATH: &str = "/proc/thread-self/ns/net";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A handle on a Linux network namespace.
///
/// The value keeps the namespace file open and owns one netlink connection created inside the
/// namespace, so link, address, route, rule and neighbor operations never need to switch the
/// calling thread. The connection is released when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct Namespace {
    path: PathBuf,
    file: Arc<File>,
    handle: Handle,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Namespace {
    /// Opens the network namespace at `path`.
    pub async fn open(path: impl AsRef<Path>) -> PeerpodResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Arc::new(File::open(&path).map_err(|e| {
            PeerpodError::NotFound(format!(
                "failed to open network namespace {}: {e}",
                path.display()
            ))
        })?);

        let ns_file = file.clone();
        let (connection, handle, _) = tokio::task::spawn_blocking(move || {
            enter(&ns_file, rtnetlink::new_connection)
        })
        .await???;

        tokio::spawn(connection);
        debug!(path = %path.display(), "opened network namespace");

        Ok(Self { path, file, handle })
    }

    /// Opens the network namespace of the current process.
    pub async fn open_current() -> PeerpodResult<Self> {
        Self::open(SELF_NETNS_PATH).await
    }

    /// Creates a persistent network namespace bind-mounted at `/run/netns/<name>`.
    pub async fn create_named(name: &str) -> PeerpodResult<Self> {
        let target = Path::new(NETNS_RUN_DIR).join(name);
        if target.exists() {
            return Err(PeerpodError::AlreadyExists(format!(
                "network namespace {name} already exists"
            )));
        }

        fs::create_dir_all(NETNS_RUN_DIR)?;
        File::create(&target)?;

        // unshare only affects the calling thread, so it runs on a throwaway one.
        let mount_target = target.clone();
        let result = std::thread::spawn(move || -> PeerpodResult<()> {
            unshare(CloneFlags::CLONE_NEWNET)?;
            mount(
                Some(THREAD_NETNS_PATH),
                &mount_target,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )?;
            Ok(())
        })
        .join()
        .map_err(|_| PeerpodError::Internal("namespace creation thread panicked".into()))?;

        if let Err(e) = result {
            let _ = fs::remove_file(&target);
            return Err(e);
        }

        Self::open(&target).await
    }

    /// Unmounts and removes a namespace created with [`Namespace::create_named`].
    pub fn delete_named(name: &str) -> PeerpodResult<()> {
        let target = Path::new(NETNS_RUN_DIR).join(name);
        if !target.exists() {
            return Err(PeerpodError::NotFound(format!(
                "network namespace {name} does not exist"
            )));
        }

        umount2(&target, MntFlags::MNT_DETACH)?;
        fs::remove_file(&target)?;
        Ok(())
    }

    /// Runs `f` with the calling thread switched into this namespace.
    ///
    /// The original namespace is restored on every exit path. The caller must stay on the same OS
    /// thread for the whole call and must not nest `run` calls; use [`Namespace::run_blocking`]
    /// from async code.
    pub fn run<F, T>(&self, f: F) -> PeerpodResult<T>
    where
        F: FnOnce() -> T,
    {
        enter(&self.file, f)
    }

    /// Runs `f` inside this namespace on a dedicated blocking thread.
    pub async fn run_blocking<F, T>(&self, f: F) -> PeerpodResult<T>
    where
        F: FnOnce() -> PeerpodResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || enter(&file, f)).await??
    }

    /// The path the namespace was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The raw file descriptor of the namespace, used to move links into it.
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// The netlink handle bound to this namespace.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn enter<F, T>(target: &File, f: F) -> PeerpodResult<T>
where
    F: FnOnce() -> T,
{
    let original = File::open(THREAD_NETNS_PATH)?;
    if same_namespace(&original, target)? {
        return Ok(f());
    }

    setns(target, CloneFlags::CLONE_NEWNET)?;

    let _restore = scopeguard::guard(original, |original| {
        if let Err(e) = setns(&original, CloneFlags::CLONE_NEWNET) {
            error!("failed to restore the original network namespace: {e}");
        }
    });

    Ok(f())
}

fn same_namespace(a: &File, b: &File) -> PeerpodResult<bool> {
    let (a, b) = (a.metadata()?, b.metadata()?);
    Ok(a.dev() == b.dev() && a.ino() == b.ino())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
