use anyhow::{anyhow, bail, Context, Result};
use nix::sys::stat::Mode;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::api::{FirecrackerClient, InstanceAction};
use super::config::BootConfig;
use super::shutdown::{spawn_signal_listener, HypervisorControl, ShutdownSignals};
use crate::paths;

/// Total socket wait is RETRY_COUNT * RETRY_DELAY
const SOCKET_WAIT_RETRY_COUNT: u32 = 50;
const SOCKET_WAIT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Owns one Firecracker child process and its control socket
pub struct VmManager {
    vm_id: String,
    socket_path: PathBuf,
    log_fifo: PathBuf,
    process: Option<Child>,
    client: Option<FirecrackerClient>,
}

/// Strip Firecracker's `<timestamp> [<instance>:<thread>] ` prefix
fn strip_firecracker_prefix(line: &str) -> &str {
    let mut rest = line;

    if rest.starts_with("20") && rest.chars().nth(4) == Some('-') {
        if let Some(pos) = rest.find(' ') {
            rest = &rest[pos + 1..];
        }
    }

    if rest.starts_with('[') {
        if let Some(end) = rest.find("] ") {
            rest = &rest[end + 2..];
        }
    }

    rest
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(target: "vm", path = %path.display(), "removed stale file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
    Log,
}

fn forward_lines<R>(reader: R, stream: Stream)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = strip_firecracker_prefix(&line);
            match stream {
                Stream::Stderr => warn!(target: "firecracker", "{}", line),
                Stream::Stdout | Stream::Log => info!(target: "firecracker", "{}", line),
            }
        }
    });
}

impl VmManager {
    pub fn new(vm_id: impl Into<String>, socket_path: PathBuf, log_fifo: PathBuf) -> Self {
        Self {
            vm_id: vm_id.into(),
            socket_path,
            log_fifo,
            process: None,
            client: None,
        }
    }

    /// Start Firecracker and wait for its API socket
    pub async fn start(&mut self, firecracker_bin: &Path) -> Result<()> {
        info!(target: "vm", vm_id = %self.vm_id, bin = %firecracker_bin.display(), "starting Firecracker");

        remove_if_exists(&self.socket_path)?;
        remove_if_exists(&self.log_fifo)?;
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        nix::unistd::mkfifo(&self.log_fifo, Mode::S_IRUSR | Mode::S_IWUSR)
            .with_context(|| format!("creating log fifo {}", self.log_fifo.display()))?;
        // read-write so the open never waits for Firecracker to connect
        let log = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&self.log_fifo)
            .with_context(|| format!("opening log fifo {}", self.log_fifo.display()))?;
        forward_lines(log, Stream::Log);

        let mut child = Command::new(firecracker_bin)
            .arg("--api-sock")
            .arg(&self.socket_path)
            .arg("--log-path")
            .arg(&self.log_fifo)
            .arg("--level")
            .arg("Info")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", firecracker_bin.display()))?;

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, Stream::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, Stream::Stderr);
        }

        self.process = Some(child);
        self.wait_for_socket().await?;
        self.client = Some(FirecrackerClient::new(self.socket_path.clone()));
        Ok(())
    }

    async fn wait_for_socket(&mut self) -> Result<()> {
        for _ in 0..SOCKET_WAIT_RETRY_COUNT {
            if self.socket_path.exists() {
                return Ok(());
            }
            if let Some(process) = self.process.as_mut() {
                if let Some(status) = process.try_wait().context("polling Firecracker")? {
                    bail!("Firecracker exited before opening its API socket: {}", status);
                }
            }
            tokio::time::sleep(SOCKET_WAIT_RETRY_DELAY).await;
        }

        bail!(
            "Firecracker socket {} not ready after {:?}",
            self.socket_path.display(),
            SOCKET_WAIT_RETRY_DELAY * SOCKET_WAIT_RETRY_COUNT
        )
    }

    pub fn client(&self) -> Result<&FirecrackerClient> {
        self.client.as_ref().context("VM not started")
    }

    pub fn pid(&self) -> Result<u32> {
        self.process
            .as_ref()
            .and_then(Child::id)
            .context("Firecracker process not running")
    }

    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let mut process = self.process.take().context("Firecracker process not running")?;
        process.wait().await.context("waiting for Firecracker")
    }

    pub async fn kill(&mut self) -> Result<()> {
        if let Some(mut process) = self.process.take() {
            info!(target: "vm", vm_id = %self.vm_id, "killing Firecracker");
            process.kill().await.context("killing Firecracker")?;
        }
        Ok(())
    }

    async fn boot(&mut self, firecracker_bin: &Path, config: &BootConfig) -> Result<FirecrackerClient> {
        self.start(firecracker_bin).await?;
        let client = self.client()?.clone();
        config.apply(&client).await?;
        client
            .put_action(InstanceAction::InstanceStart)
            .await
            .context("starting instance")?;
        Ok(client)
    }

    /// Boot the guest and block until Firecracker exits.
    ///
    /// `signals` are translated into shutdown actions once the guest is
    /// booting; one that arrives earlier aborts the boot and kills
    /// Firecracker. A non-zero exit is returned as an error.
    pub async fn run(
        &mut self,
        firecracker_bin: &Path,
        config: &BootConfig,
        graceful_timeout: Duration,
        mut signals: ShutdownSignals,
    ) -> Result<()> {
        let booted = tokio::select! {
            biased;
            Some(received) = signals.recv() => {
                warn!(target: "vm", vm_id = %self.vm_id, ?received, "signal before boot completed");
                Err(anyhow!("received {:?} before the guest booted", received))
            }
            booted = self.boot(firecracker_bin, config) => booted,
        };
        let client = match booted {
            Ok(client) => client,
            Err(e) => {
                if let Err(kill_err) = self.kill().await {
                    warn!(target: "vm", "{:#}", kill_err);
                }
                return Err(e);
            }
        };
        info!(target: "vm", vm_id = %self.vm_id, "guest booting");

        let control = Arc::new(HypervisorControl::new(client, self.pid()?));
        let listener = spawn_signal_listener(signals, control, graceful_timeout);

        let status = self.wait().await;
        listener.abort();

        let status = status?;
        info!(target: "vm", vm_id = %self.vm_id, %status, "Firecracker exited");
        if !status.success() {
            bail!("Firecracker exited with {}", status);
        }
        Ok(())
    }
}

/// Runs a guest to completion. The coordinator's only view of the hypervisor.
#[async_trait::async_trait]
pub trait Supervisor: Send + Sync {
    async fn supervise(
        &self,
        vm_id: &str,
        config: BootConfig,
        signals: ShutdownSignals,
    ) -> Result<()>;
}

pub struct FirecrackerSupervisor {
    firecracker_bin: PathBuf,
    graceful_timeout: Duration,
}

impl FirecrackerSupervisor {
    pub fn new(firecracker_bin: PathBuf, graceful_timeout: Duration) -> Self {
        Self {
            firecracker_bin,
            graceful_timeout,
        }
    }
}

#[async_trait::async_trait]
impl Supervisor for FirecrackerSupervisor {
    async fn supervise(
        &self,
        vm_id: &str,
        config: BootConfig,
        signals: ShutdownSignals,
    ) -> Result<()> {
        let mut vm = VmManager::new(vm_id, paths::api_socket(vm_id), paths::log_fifo(vm_id));
        vm.run(&self.firecracker_bin, &config, self.graceful_timeout, signals)
            .await
    }
}

impl Drop for VmManager {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(&self.log_fifo);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firecracker::ShutdownSignal;

    #[test]
    fn test_strip_firecracker_prefix() {
        assert_eq!(
            strip_firecracker_prefix(
                "2025-11-15T17:18:55.027478889 [anonymous-instance:main] Running Firecracker v1.7.0"
            ),
            "Running Firecracker v1.7.0"
        );
        assert_eq!(
            strip_firecracker_prefix("[fc:fc_vcpu 0] Received KVM_EXIT_SHUTDOWN signal"),
            "Received KVM_EXIT_SHUTDOWN signal"
        );
        assert_eq!(strip_firecracker_prefix("plain line"), "plain line");
    }

    #[tokio::test]
    async fn test_start_fails_when_binary_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = VmManager::new(
            "abc",
            dir.path().join("firecracker.sock"),
            dir.path().join("firecracker.log"),
        );
        let err = vm
            .start(&dir.path().join("no-such-firecracker"))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("spawning"));
    }

    #[tokio::test]
    async fn test_start_clears_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("firecracker.sock");
        std::fs::write(&socket, b"stale").unwrap();

        let mut vm = VmManager::new("abc", socket.clone(), dir.path().join("firecracker.log"));
        assert!(vm.start(Path::new("/nonexistent/firecracker")).await.is_err());
        assert!(!socket.exists());
    }

    /// Stand-in binary that never opens an API socket
    fn silent_firecracker(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let bin = dir.join("firecracker");
        std::fs::write(&bin, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        bin
    }

    #[tokio::test]
    async fn test_signal_during_socket_wait_aborts_boot() {
        let dir = tempfile::tempdir().unwrap();
        let bin = silent_firecracker(dir.path());
        let socket = dir.path().join("firecracker.sock");
        let mut vm = VmManager::new("abc", socket.clone(), dir.path().join("firecracker.log"));
        let config = BootConfig::new(
            Path::new("/kernels/vmlinux"),
            "",
            Path::new("/dev/mapper/fcspawn-abc"),
            1,
            128,
            Vec::new(),
        );

        let (tx, signals) = ShutdownSignals::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            tx.send(ShutdownSignal::Terminate).unwrap();
            // keep the sender alive until the run has returned
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let started = std::time::Instant::now();
        let err = vm
            .run(&bin, &config, Duration::from_secs(20), signals)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("before the guest booted"));
        // well short of the socket wait
        assert!(started.elapsed() < SOCKET_WAIT_RETRY_DELAY * SOCKET_WAIT_RETRY_COUNT);
        assert!(vm.pid().is_err(), "Firecracker killed");
    }

    #[tokio::test]
    async fn test_signal_before_start_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = VmManager::new(
            "abc",
            dir.path().join("firecracker.sock"),
            dir.path().join("firecracker.log"),
        );
        let config = BootConfig::new(
            Path::new("/kernels/vmlinux"),
            "",
            Path::new("/dev/mapper/fcspawn-abc"),
            1,
            128,
            Vec::new(),
        );

        let (tx, signals) = ShutdownSignals::channel();
        tx.send(ShutdownSignal::Interrupt).unwrap();

        let err = vm
            .run(&silent_firecracker(dir.path()), &config, Duration::from_secs(20), signals)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Interrupt"));
        assert!(!dir.path().join("firecracker.log").exists());
    }
}
