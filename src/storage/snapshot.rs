//! Copy-on-write root device for a VM.
//!
//! ```text
//! fcspawn-<uid>        snapshot  origin + overlay loop, persistent, chunked
//!   fcspawn-<uid>-base linear base loop, then zero fill   (overlay > base only)
//!     /dev/loopN       image.ext4, read-only
//!   /dev/loopM         overlay.dm
//! ```
//!
//! Loop devices are detached as soon as the mapping exists; the dm layer
//! keeps them referenced until the mapping is removed.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::device::{BlockDevice, LoopDevice, MapperDevice, PhysicalDevice};
use super::lock::HostLock;
use super::tools::{is_not_found, DeviceTools};
use crate::paths;

pub fn base_table(base: &Path, base_sectors: u64, total_sectors: u64) -> String {
    format!(
        "0 {} linear {} 0\n{} {} zero",
        base_sectors,
        base.display(),
        base_sectors,
        total_sectors - base_sectors
    )
}

pub fn snapshot_table(sectors: u64, origin: &Path, overlay: &Path, chunk_sectors: u32) -> String {
    format!(
        "0 {} snapshot {} {} P {}",
        sectors,
        origin.display(),
        overlay.display(),
        chunk_sectors
    )
}

/// The device-mapper stack backing one VM's root filesystem
pub struct SnapshotChain {
    uid: String,
    tools: Arc<dyn DeviceTools>,
    lock_path: PathBuf,
    chunk_sectors: u32,
}

impl SnapshotChain {
    pub fn new(
        uid: impl Into<String>,
        tools: Arc<dyn DeviceTools>,
        lock_path: impl Into<PathBuf>,
        chunk_sectors: u32,
    ) -> Self {
        Self {
            uid: uid.into(),
            tools,
            lock_path: lock_path.into(),
            chunk_sectors,
        }
    }

    /// Node the hypervisor opens as the root drive
    pub fn device_path(&self) -> PathBuf {
        paths::mapper_path(&paths::snapshot_dm_name(&self.uid))
    }

    /// Build the chain over `base_image` and `overlay`, returning the
    /// snapshot device. A chain that is already active is left untouched.
    pub async fn activate(&self, base_image: &Path, overlay: &Path) -> Result<PathBuf> {
        let device = self.device_path();
        if self.tools.device_exists(&device).await {
            info!(target: "storage", device = %device.display(), "snapshot already active");
            return Ok(device);
        }

        let _lock = HostLock::acquire(&self.lock_path).await?;
        if self.tools.device_exists(&device).await {
            info!(
                target: "storage",
                device = %device.display(),
                "snapshot activated by another process"
            );
            return Ok(device);
        }

        let mut base = self.base_device(base_image).await;
        let mut overlay_loop = LoopDevice::new(overlay, false);

        let result = self.build(base.as_mut(), &mut overlay_loop).await;

        let released = [
            base.release(self.tools.as_ref()).await,
            overlay_loop.release(self.tools.as_ref()).await,
        ];
        for e in released.into_iter().filter_map(Result::err) {
            warn!(target: "storage", "{:#}", e);
        }

        let device = result?;
        info!(target: "storage", vm_id = %self.uid, device = %device.display(), "snapshot active");
        Ok(device)
    }

    async fn base_device(&self, base_image: &Path) -> Box<dyn BlockDevice> {
        if self.tools.is_block_device(base_image).await {
            Box::new(PhysicalDevice::new(base_image))
        } else {
            Box::new(LoopDevice::new(base_image, true))
        }
    }

    async fn build(
        &self,
        base: &mut dyn BlockDevice,
        overlay: &mut dyn BlockDevice,
    ) -> Result<PathBuf> {
        let tools = self.tools.as_ref();

        base.activate(tools).await?;
        overlay.activate(tools).await?;
        let base_path = base.require_path()?.to_path_buf();
        let overlay_path = overlay.require_path()?.to_path_buf();

        let base_sectors = tools.size_sectors(&base_path).await?;
        let overlay_sectors = tools.size_sectors(&overlay_path).await?;
        debug!(target: "storage", base_sectors, overlay_sectors, "sizing snapshot");

        if overlay_sectors < base_sectors {
            bail!(
                "overlay ({} sectors) is smaller than the base image ({} sectors)",
                overlay_sectors,
                base_sectors
            );
        }

        // left over from an activation that died before the snapshot existed
        let padded_name = paths::base_dm_name(&self.uid);
        if tools.dm_exists(&padded_name).await {
            warn!(target: "storage", name = %padded_name, "removing stale padded base");
            tools
                .dm_remove(&[padded_name])
                .await
                .context("removing stale padded base")?;
        }

        let mut created = Vec::new();
        let result = self
            .stack(&base_path, base_sectors, &overlay_path, overlay_sectors, &mut created)
            .await;

        if result.is_err() && !created.is_empty() {
            created.reverse();
            if let Err(e) = tools.dm_remove(&created).await {
                warn!(target: "storage", "rolling back snapshot devices: {:#}", e);
            }
        }
        result
    }

    /// Create the dm devices, recording each one in `created` (bottom first)
    async fn stack(
        &self,
        base_path: &Path,
        base_sectors: u64,
        overlay_path: &Path,
        overlay_sectors: u64,
        created: &mut Vec<String>,
    ) -> Result<PathBuf> {
        let tools = self.tools.as_ref();
        let grow = overlay_sectors > base_sectors;

        let origin = if grow {
            let mut padded = MapperDevice::new(
                paths::base_dm_name(&self.uid),
                base_table(base_path, base_sectors, overlay_sectors),
            );
            padded.activate(tools).await?;
            created.push(padded.name().to_string());
            padded.require_path()?.to_path_buf()
        } else {
            base_path.to_path_buf()
        };

        let mut snapshot = MapperDevice::new(
            paths::snapshot_dm_name(&self.uid),
            snapshot_table(overlay_sectors, &origin, overlay_path, self.chunk_sectors),
        );
        snapshot.activate(tools).await?;
        created.push(snapshot.name().to_string());
        let device = snapshot.require_path()?.to_path_buf();

        if let Err(e) = tools.fsck(&device).await {
            warn!(target: "storage", device = %device.display(), "filesystem check failed: {:#}", e);
        }
        if grow {
            tools
                .resize_fs(&device)
                .await
                .with_context(|| format!("growing filesystem on {}", device.display()))?;
        }

        Ok(device)
    }

    /// Remove the snapshot and, when present, the zero-padded base.
    /// A chain that is already gone counts as removed.
    pub async fn deactivate(&self) -> Result<()> {
        let _lock = HostLock::acquire(&self.lock_path).await?;

        let mut names = vec![paths::snapshot_dm_name(&self.uid)];
        let padded = paths::base_dm_name(&self.uid);
        if self.tools.dm_exists(&padded).await {
            names.push(padded);
        }

        match self.tools.dm_remove(&names).await {
            Ok(()) => {
                info!(target: "storage", vm_id = %self.uid, "snapshot removed");
                Ok(())
            }
            Err(e) if is_not_found(&format!("{:#}", e)) => {
                debug!(target: "storage", vm_id = %self.uid, "snapshot already removed");
                Ok(())
            }
            Err(e) => Err(e).context("removing snapshot devices"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tools::fake::FakeTools;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BASE: &str = "/images/image.ext4";
    const OVERLAY: &str = "/vms/abc/overlay.dm";

    fn chain(tools: Arc<FakeTools>, dir: &tempfile::TempDir) -> SnapshotChain {
        SnapshotChain::new("abc", tools, dir.path().join("dm.lock"), 8)
    }

    #[tokio::test]
    async fn test_equal_sizes_use_base_loop_directly() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(FakeTools::with_sizes(&[(BASE, 4), (OVERLAY, 4)]));

        let device = chain(tools.clone(), &dir)
            .activate(Path::new(BASE), Path::new(OVERLAY))
            .await
            .unwrap();

        assert_eq!(device, PathBuf::from("/dev/mapper/fcspawn-abc"));
        assert_eq!(
            tools.calls(),
            vec![
                "attach /images/image.ext4 /dev/loop0 ro",
                "attach /vms/abc/overlay.dm /dev/loop1",
                "create fcspawn-abc 0 4 snapshot /dev/loop0 /dev/loop1 P 8",
                "fsck /dev/mapper/fcspawn-abc",
                "detach /dev/loop0",
                "detach /dev/loop1",
            ]
        );
    }

    #[tokio::test]
    async fn test_larger_overlay_pads_base_and_grows() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(FakeTools::with_sizes(&[(BASE, 4), (OVERLAY, 8)]));

        chain(tools.clone(), &dir)
            .activate(Path::new(BASE), Path::new(OVERLAY))
            .await
            .unwrap();

        assert_eq!(
            tools.calls(),
            vec![
                "attach /images/image.ext4 /dev/loop0 ro",
                "attach /vms/abc/overlay.dm /dev/loop1",
                "create fcspawn-abc-base 0 4 linear /dev/loop0 0\n4 4 zero",
                "create fcspawn-abc 0 8 snapshot /dev/mapper/fcspawn-abc-base /dev/loop1 P 8",
                "fsck /dev/mapper/fcspawn-abc",
                "resize /dev/mapper/fcspawn-abc",
                "detach /dev/loop0",
                "detach /dev/loop1",
            ]
        );
    }

    #[tokio::test]
    async fn test_activate_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(FakeTools::with_sizes(&[(BASE, 4), (OVERLAY, 8)]));
        let chain = chain(tools.clone(), &dir);

        chain.activate(Path::new(BASE), Path::new(OVERLAY)).await.unwrap();
        let calls = tools.calls().len();
        let device = chain.activate(Path::new(BASE), Path::new(OVERLAY)).await.unwrap();

        assert_eq!(device, chain.device_path());
        assert_eq!(tools.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_smaller_overlay_rejected_and_loops_released() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(FakeTools::with_sizes(&[(BASE, 8), (OVERLAY, 4)]));

        let err = chain(tools.clone(), &dir)
            .activate(Path::new(BASE), Path::new(OVERLAY))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("smaller than the base image"));
        let calls = tools.calls();
        assert!(calls.iter().all(|c| !c.starts_with("create")));
        assert!(calls.contains(&"detach /dev/loop0".to_string()));
        assert!(calls.contains(&"detach /dev/loop1".to_string()));
    }

    #[tokio::test]
    async fn test_deactivate_removes_padded_base() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(FakeTools::with_sizes(&[(BASE, 4), (OVERLAY, 8)]));
        let chain = chain(tools.clone(), &dir);

        chain.activate(Path::new(BASE), Path::new(OVERLAY)).await.unwrap();
        chain.deactivate().await.unwrap();

        assert_eq!(
            tools.calls().last().unwrap(),
            "remove fcspawn-abc fcspawn-abc-base"
        );
        assert!(!tools.device_exists(&chain.device_path()).await);
    }

    /// FakeTools whose filesystem grow fails the first `failures` times
    struct FailingResize {
        inner: FakeTools,
        failures: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DeviceTools for FailingResize {
        async fn attach_loop(&self, file: &Path, read_only: bool) -> Result<PathBuf> {
            self.inner.attach_loop(file, read_only).await
        }
        async fn detach_loop(&self, device: &Path) -> Result<()> {
            self.inner.detach_loop(device).await
        }
        async fn size_sectors(&self, device: &Path) -> Result<u64> {
            self.inner.size_sectors(device).await
        }
        async fn dm_create(&self, name: &str, table: &str) -> Result<()> {
            self.inner.dm_create(name, table).await
        }
        async fn dm_exists(&self, name: &str) -> bool {
            self.inner.dm_exists(name).await
        }
        async fn dm_remove(&self, names: &[String]) -> Result<()> {
            self.inner.dm_remove(names).await
        }
        async fn fsck(&self, device: &Path) -> Result<()> {
            self.inner.fsck(device).await
        }
        async fn resize_fs(&self, device: &Path) -> Result<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                bail!("resize2fs: Device or resource busy");
            }
            self.inner.resize_fs(device).await
        }
        async fn device_exists(&self, device: &Path) -> bool {
            self.inner.device_exists(device).await
        }
        async fn is_block_device(&self, path: &Path) -> bool {
            self.inner.is_block_device(path).await
        }
    }

    #[tokio::test]
    async fn test_failed_grow_rolls_back_and_retries_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(FailingResize {
            inner: FakeTools::with_sizes(&[(BASE, 4), (OVERLAY, 8)]),
            failures: AtomicUsize::new(1),
        });
        let chain = SnapshotChain::new("abc", tools.clone(), dir.path().join("dm.lock"), 8);

        let err = chain
            .activate(Path::new(BASE), Path::new(OVERLAY))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("growing filesystem"));
        assert!(!tools.device_exists(&chain.device_path()).await);
        assert!(!tools.dm_exists("fcspawn-abc-base").await);

        let calls = tools.inner.calls();
        let rollback = calls
            .iter()
            .position(|c| c == "remove fcspawn-abc fcspawn-abc-base")
            .unwrap();
        // dm devices go before their loop devices
        assert!(rollback < calls.iter().position(|c| c.starts_with("detach")).unwrap());

        chain.activate(Path::new(BASE), Path::new(OVERLAY)).await.unwrap();
        assert!(tools.device_exists(&chain.device_path()).await);
        assert_eq!(tools.inner.calls().last().unwrap(), "detach /dev/loop3");
        assert!(tools
            .inner
            .calls()
            .contains(&"resize /dev/mapper/fcspawn-abc".to_string()));
    }

    #[tokio::test]
    async fn test_stale_padded_base_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(FakeTools::with_sizes(&[(BASE, 4), (OVERLAY, 8)]));
        tools
            .nodes
            .lock()
            .unwrap()
            .insert(paths::mapper_path("fcspawn-abc-base"));

        chain(tools.clone(), &dir)
            .activate(Path::new(BASE), Path::new(OVERLAY))
            .await
            .unwrap();

        let calls = tools.calls();
        assert_eq!(calls[2], "remove fcspawn-abc-base");
        assert!(calls[3].starts_with("create fcspawn-abc-base "));
    }

    #[tokio::test]
    async fn test_block_device_base_used_directly() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(FakeTools::with_sizes(&[("/dev/vdb", 4), (OVERLAY, 4)]));
        tools.nodes.lock().unwrap().insert(PathBuf::from("/dev/vdb"));

        chain(tools.clone(), &dir)
            .activate(Path::new("/dev/vdb"), Path::new(OVERLAY))
            .await
            .unwrap();

        assert_eq!(
            tools.calls(),
            vec![
                "attach /vms/abc/overlay.dm /dev/loop0",
                "create fcspawn-abc 0 4 snapshot /dev/vdb /dev/loop0 P 8",
                "fsck /dev/mapper/fcspawn-abc",
                "detach /dev/loop0",
            ]
        );
    }

    #[tokio::test]
    async fn test_deactivate_missing_chain_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(FakeTools::default());

        chain(tools.clone(), &dir).deactivate().await.unwrap();
        assert_eq!(tools.calls(), vec!["remove fcspawn-abc"]);
    }
}
