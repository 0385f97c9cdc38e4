use anyhow::{Context, Result};
use nix::fcntl::{Flock, FlockArg};
use std::fs::File;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive host-wide lock serializing device-mapper changes across
/// independent fcspawn processes. Released on drop.
pub struct HostLock {
    path: PathBuf,
    _flock: Flock<File>,
}

impl HostLock {
    /// Block until the lock at `path` is ours
    pub async fn acquire(path: &Path) -> Result<Self> {
        let owned = path.to_path_buf();
        let flock = tokio::task::spawn_blocking(move || -> Result<Flock<File>> {
            if let Some(parent) = owned.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .mode(0o600)
                .open(&owned)
                .with_context(|| format!("opening lock file {}", owned.display()))?;
            Flock::lock(file, FlockArg::LockExclusive)
                .map_err(|(_, err)| err)
                .with_context(|| format!("locking {}", owned.display()))
        })
        .await
        .context("lock task panicked")??;

        debug!(target: "storage", lock = %path.display(), "acquired host lock");
        Ok(Self {
            path: path.to_path_buf(),
            _flock: flock,
        })
    }
}

impl Drop for HostLock {
    fn drop(&mut self) {
        debug!(target: "storage", lock = %self.path.display(), "released host lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks/dm.lock");

        let first = HostLock::acquire(&path).await.unwrap();

        let contender = tokio::spawn({
            let path = path.clone();
            async move { HostLock::acquire(&path).await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!contender.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(5), contender)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
