//! Lifecycle coordinator: provision network and storage, mark the VM
//! running, supervise the hypervisor, then tear everything down.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::teardown::run_teardown;
use crate::cli::Cli;
use crate::config::SpawnConfig;
use crate::firecracker::{BootConfig, FirecrackerSupervisor, ShutdownSignals, Supervisor};
use crate::network::{
    self, dhcp, discover, interface_modes, take_over, DiscoveryOptions, IpCommand, LinkOps,
    NetworkSetup,
};
use crate::paths;
use crate::state::{validate_uid, StateManager, VmRecord, VmStore};
use crate::storage::{base_image_size, ensure_overlay, DeviceTools, HostTools, SnapshotChain};

/// Everything one VM run talks to
pub struct Spawner {
    pub store: Arc<dyn VmStore>,
    pub links: Arc<dyn LinkOps>,
    pub devices: Arc<dyn DeviceTools>,
    pub supervisor: Arc<dyn Supervisor>,
    pub config: SpawnConfig,
}

impl Spawner {
    /// Wire up the real host: iproute2, device-mapper and Firecracker
    pub fn host(store: Arc<dyn VmStore>, config: SpawnConfig) -> Self {
        let supervisor = FirecrackerSupervisor::new(
            config.firecracker_bin.clone(),
            config.graceful_shutdown_timeout,
        );
        Self {
            store,
            links: Arc::new(IpCommand),
            devices: Arc::new(HostTools),
            supervisor: Arc::new(supervisor),
            config,
        }
    }

    async fn provision_network(&self, record: &VmRecord) -> Result<NetworkSetup> {
        let opts = DiscoveryOptions {
            modes: interface_modes(&record.metadata.annotations),
            poll_interval: self.config.network_poll_interval,
            timeout: self.config.network_timeout,
        };
        let candidates = discover(self.links.as_ref(), &opts).await?;
        let (dns, dns6) = network::read_dns_servers(&self.config.resolv_conf);
        take_over(self.links.as_ref(), candidates, &dns, &dns6).await
    }

    async fn provision_storage(&self, record: &VmRecord, chain: &SnapshotChain) -> Result<PathBuf> {
        let base_image = paths::image_fs(&record.status.image.id);
        let overlay = paths::overlay_file(record.uid());
        let base_size = base_image_size(self.devices.as_ref(), &base_image).await?;
        ensure_overlay(&overlay, record.spec.disk_size_bytes, base_size).await?;
        chain.activate(&base_image, &overlay).await
    }

    /// Best-effort release of storage on a setup path that never saved
    async fn release_storage(&self, chain: &SnapshotChain) {
        if let Err(e) = chain.deactivate().await {
            warn!("releasing storage: {:#}", e);
        }
    }

    /// Run the VM identified by `vm_id` to completion.
    ///
    /// Setup failures return before anything is saved. Once the VM has been
    /// saved as running, teardown always runs and saves it once more; the
    /// hypervisor's error, if any, is what gets returned.
    pub async fn run(&self, vm_id: &str) -> Result<()> {
        let mut record = self
            .store
            .load(vm_id)
            .await
            .with_context(|| format!("loading VM {}", vm_id))?;
        let uid = record.uid().to_string();
        validate_uid(&uid)?;
        if record.status.image.id.is_empty() {
            bail!("VM {} has no imported image", uid);
        }
        if record.status.kernel.id.is_empty() {
            bail!("VM {} has no imported kernel", uid);
        }
        if record.status.running {
            warn!(vm_id = %uid, "record still marked running from an earlier run");
        }
        info!(vm_id = %uid, name = %record.name(), phase = %record.phase(), "starting VM");

        let network = self
            .provision_network(&record)
            .await
            .context("provisioning network")?;
        let responders = dhcp::spawn_responders(&network, self.config.dhcpv6);

        let chain = SnapshotChain::new(
            uid.clone(),
            self.devices.clone(),
            self.config.lock_path.clone(),
            self.config.snapshot_chunk_sectors,
        );
        let root = match self.provision_storage(&record, &chain).await {
            Ok(root) => root,
            Err(e) => {
                abort_all(&responders);
                self.release_storage(&chain).await;
                return Err(e.context("provisioning storage"));
            }
        };

        let boot = BootConfig::new(
            &paths::kernel_image(&record.status.kernel.id),
            &record.spec.kernel.cmd_line,
            &root,
            record.spec.cpus,
            record.spec.memory_mib,
            network.guest_nics(),
        );

        // from here on a signal must reach teardown instead of killing us
        let signals = match ShutdownSignals::install() {
            Ok(signals) => signals,
            Err(e) => {
                abort_all(&responders);
                self.release_storage(&chain).await;
                return Err(e);
            }
        };

        record.mark_running(network.ip_addresses(), Utc::now());
        if let Err(e) = self.store.save(&record).await {
            abort_all(&responders);
            self.release_storage(&chain).await;
            return Err(e.context("saving running state"));
        }
        info!(vm_id = %uid, ips = ?record.ip_addresses(), root = %root.display(), "VM running");

        let supervisor = self.supervisor.clone();
        let id = uid.clone();
        let supervised =
            tokio::spawn(async move { supervisor.supervise(&id, boot, signals).await });
        let outcome = match supervised.await {
            Ok(result) => result,
            Err(e) => Err(anyhow!("hypervisor supervisor panicked: {}", e)),
        };
        abort_all(&responders);

        match &outcome {
            Ok(()) => info!(vm_id = %uid, "hypervisor exited"),
            Err(e) => warn!(vm_id = %uid, "hypervisor failed: {:#}", e),
        }

        let report = run_teardown(&mut record, &chain, self.store.as_ref()).await;
        outcome?;
        report.into_result()
    }
}

fn abort_all(handles: &[JoinHandle<()>]) {
    for handle in handles {
        handle.abort();
    }
}

pub async fn cmd_spawn(cli: Cli) -> Result<()> {
    let store = StateManager::new(paths::state_dir());
    store.init().await?;

    Spawner::host(Arc::new(store), cli.spawn_config())
        .run(&cli.vm_id)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::teardown::tests::RecordingStore;
    use crate::network::takeover::fake::{link, loopback, FakeLinks};
    use crate::state::types::fixtures::record;
    use crate::storage::tools::fake::FakeTools;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::sync::{Mutex, OnceLock};
    use std::time::Duration;

    /// paths::base_dir is process-wide; every test here shares one temp dir
    fn base_dir() -> &'static Path {
        static DIR: OnceLock<tempfile::TempDir> = OnceLock::new();
        let dir = DIR.get_or_init(|| {
            let dir = tempfile::tempdir().unwrap();
            paths::init_base_dir(Some(dir.path()));
            let image = paths::image_fs("img-1");
            std::fs::create_dir_all(image.parent().unwrap()).unwrap();
            std::fs::File::create(&image).unwrap().set_len(1 << 20).unwrap();
            dir
        });
        dir.path()
    }

    enum Outcome {
        Exit,
        Fail,
        Panic,
        Signalled,
    }

    /// Captures the boot config and the store contents at hypervisor start
    struct FakeSupervisor {
        outcome: Outcome,
        store: Arc<RecordingStore>,
        booted: Mutex<Option<(BootConfig, Vec<VmRecord>)>>,
    }

    #[async_trait::async_trait]
    impl Supervisor for FakeSupervisor {
        async fn supervise(
            &self,
            _vm_id: &str,
            config: BootConfig,
            mut signals: ShutdownSignals,
        ) -> Result<()> {
            *self.booted.lock().unwrap() = Some((config, self.store.saved()));
            match self.outcome {
                Outcome::Exit => Ok(()),
                Outcome::Signalled => {
                    // the signal lands while the hypervisor is still starting
                    nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM)?;
                    let received = signals.recv().await;
                    bail!("received {:?} before the guest booted", received)
                }
                Outcome::Fail => bail!("Firecracker exited with exit status: 1"),
                Outcome::Panic => panic!("supervisor blew up"),
            }
        }
    }

    struct Harness {
        store: Arc<RecordingStore>,
        tools: Arc<FakeTools>,
        links: Arc<FakeLinks>,
        supervisor: Arc<FakeSupervisor>,
        spawner: Spawner,
    }

    fn harness(uid: &str, outcome: Outcome) -> Harness {
        let base = base_dir();
        let store = Arc::new(RecordingStore::with(record(uid)));
        let tools = Arc::new(FakeTools::with_sizes(&[
            (paths::image_fs("img-1").to_str().unwrap(), 2048),
            (paths::overlay_file(uid).to_str().unwrap(), 8192),
        ]));
        let links = Arc::new(FakeLinks {
            links: Mutex::new(vec![
                loopback(),
                link("eth0", "02:42:ac:11:00:02", Some("172.17.0.2/16")),
            ]),
            gateways: [("eth0".to_string(), "172.17.0.1".parse().unwrap())].into(),
            ..Default::default()
        });
        let supervisor = Arc::new(FakeSupervisor {
            outcome,
            store: store.clone(),
            booted: Mutex::new(None),
        });
        let config = SpawnConfig {
            lock_path: base.join(format!("{}.lock", uid)),
            resolv_conf: base.join("no-resolv.conf"),
            network_timeout: Duration::from_secs(60),
            ..SpawnConfig::default()
        };
        let spawner = Spawner {
            store: store.clone(),
            links: links.clone(),
            devices: tools.clone(),
            supervisor: supervisor.clone(),
            config,
        };
        Harness {
            store,
            tools,
            links,
            supervisor,
            spawner,
        }
    }

    fn assert_cleanly_stopped(saved: &[VmRecord]) {
        assert_eq!(saved.len(), 2, "exactly two saves");
        assert!(saved[0].status.running);
        assert_eq!(saved[0].ip_addresses(), &["172.17.0.2".parse::<std::net::Ipv4Addr>().unwrap()]);
        assert_eq!(saved[0].runtime_ports().len(), 1);

        assert!(!saved[1].status.running);
        assert!(saved[1].ip_addresses().is_empty());
        assert!(saved[1].runtime_ports().is_empty());
    }

    #[tokio::test]
    async fn test_successful_run_saves_twice() {
        let h = harness("spawn-ok", Outcome::Exit);

        h.spawner.run("spawn-ok").await.unwrap();

        assert_cleanly_stopped(&h.store.saved());

        let (boot, saved_at_boot) = h.supervisor.booted.lock().unwrap().take().unwrap();
        assert_eq!(saved_at_boot.len(), 1, "running state saved before the hypervisor starts");
        assert_eq!(boot.root_device, PathBuf::from("/dev/mapper/fcspawn-spawn-ok"));
        assert_eq!(boot.kernel_image, paths::kernel_image("kern-1"));
        assert_eq!(boot.nics.len(), 1);
        assert_eq!(boot.nics[0].tap, "vm_eth0");
        assert_eq!(boot.nics[0].mac.to_string(), "02:42:ac:11:00:02");
        assert_eq!(boot.vcpu_count, 2);

        let calls = h.tools.calls();
        assert!(calls.iter().any(|c| c.starts_with("create fcspawn-spawn-ok-base")));
        assert_eq!(
            calls.last().unwrap(),
            "remove fcspawn-spawn-ok fcspawn-spawn-ok-base"
        );
        assert!(h
            .links
            .calls()
            .contains(&"addr del eth0 172.17.0.2/16".to_string()));
    }

    #[tokio::test]
    async fn test_hypervisor_error_still_tears_down() {
        let h = harness("spawn-fail", Outcome::Fail);

        let err = h.spawner.run("spawn-fail").await.unwrap_err();

        assert!(err.to_string().contains("exit status: 1"));
        assert_cleanly_stopped(&h.store.saved());
        assert!(h.tools.calls().last().unwrap().starts_with("remove"));
    }

    #[tokio::test]
    async fn test_supervisor_panic_still_tears_down() {
        let h = harness("spawn-panic", Outcome::Panic);

        let err = h.spawner.run("spawn-panic").await.unwrap_err();

        assert!(err.to_string().contains("panicked"));
        assert_cleanly_stopped(&h.store.saved());
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_timeout_aborts_before_any_save() {
        let h = harness("spawn-nonet", Outcome::Exit);
        h.links.links.lock().unwrap().retain(|l| l.loopback);

        let err = h.spawner.run("spawn-nonet").await.unwrap_err();

        assert!(format!("{:#}", err).contains("timed out"));
        assert!(h.store.saved().is_empty());
        assert!(h.tools.calls().is_empty());
        assert!(h.supervisor.booted.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_running_save_releases_storage() {
        let h = harness("spawn-nosave", Outcome::Exit);
        h.store.fail_saves.store(true, Ordering::SeqCst);

        let err = h.spawner.run("spawn-nosave").await.unwrap_err();

        assert!(format!("{:#}", err).contains("saving running state"));
        assert!(h.supervisor.booted.lock().unwrap().is_none());
        assert!(h.tools.calls().last().unwrap().starts_with("remove fcspawn-spawn-nosave"));
    }

    #[tokio::test]
    async fn test_sigterm_during_boot_still_tears_down() {
        let h = harness("spawn-sigterm", Outcome::Signalled);

        let err = h.spawner.run("spawn-sigterm").await.unwrap_err();

        assert!(err.to_string().contains("Terminate"));
        assert_cleanly_stopped(&h.store.saved());
        assert_eq!(
            h.tools.calls().last().unwrap(),
            "remove fcspawn-spawn-sigterm fcspawn-spawn-sigterm-base"
        );
    }

    #[tokio::test]
    async fn test_storage_failure_releases_devices_without_saving() {
        let h = harness("spawn-nostore", Outcome::Exit);
        // overlay smaller than the base image
        h.tools
            .sizes
            .lock()
            .unwrap()
            .insert(paths::overlay_file("spawn-nostore"), 1024);

        let err = h.spawner.run("spawn-nostore").await.unwrap_err();

        assert!(format!("{:#}", err).contains("provisioning storage"));
        assert!(h.store.saved().is_empty());
        assert!(h.supervisor.booted.lock().unwrap().is_none());
        assert_eq!(h.tools.calls().last().unwrap(), "remove fcspawn-spawn-nostore");
    }

    #[tokio::test]
    async fn test_unknown_vm() {
        let h = harness("spawn-known", Outcome::Exit);
        let err = h.spawner.run("nope").await.unwrap_err();
        assert!(format!("{:#}", err).contains("loading VM nope"));
        assert!(h.links.calls().is_empty());
    }
}
