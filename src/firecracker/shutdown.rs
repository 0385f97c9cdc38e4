//! Translate process signals into hypervisor shutdown actions.
//!
//! SIGINT/SIGTERM press the guest's power button, wait, and press it again;
//! if the second press is still accepted the guest ignored the first one and
//! the hypervisor is killed. SIGQUIT kills straight away.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::api::{FirecrackerClient, InstanceAction};

#[async_trait::async_trait]
pub trait ShutdownTarget: Send + Sync {
    /// Ask the guest to power off. Succeeds only while the hypervisor answers.
    async fn request_shutdown(&self) -> Result<()>;

    async fn force_kill(&self) -> Result<()>;
}

/// The running Firecracker process
pub struct HypervisorControl {
    client: FirecrackerClient,
    pid: Pid,
}

impl HypervisorControl {
    pub fn new(client: FirecrackerClient, pid: u32) -> Self {
        Self {
            client,
            pid: Pid::from_raw(pid as i32),
        }
    }
}

#[async_trait::async_trait]
impl ShutdownTarget for HypervisorControl {
    async fn request_shutdown(&self) -> Result<()> {
        self.client
            .put_action(InstanceAction::SendCtrlAltDel)
            .await
            .context("sending Ctrl+Alt+Del")
    }

    async fn force_kill(&self) -> Result<()> {
        match kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("killing hypervisor pid {}", self.pid)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Quit,
}

pub async fn handle_signal(
    signal: ShutdownSignal,
    target: &dyn ShutdownTarget,
    grace: Duration,
) -> Result<()> {
    if signal == ShutdownSignal::Quit {
        warn!(target: "shutdown", "SIGQUIT: killing hypervisor");
        return target.force_kill().await;
    }

    info!(target: "shutdown", ?signal, "requesting graceful shutdown");
    if let Err(e) = target.request_shutdown().await {
        debug!(target: "shutdown", "shutdown request failed: {:#}", e);
    }

    tokio::time::sleep(grace).await;

    if target.request_shutdown().await.is_ok() {
        warn!(
            target: "shutdown",
            "guest still running {:?} after shutdown request, killing hypervisor",
            grace
        );
        target.force_kill().await?;
    }
    Ok(())
}

/// SIGINT, SIGTERM and SIGQUIT as a stream, captured from installation on.
/// Once installed these signals no longer terminate the process, so the
/// owner must act on what it receives.
pub struct ShutdownSignals {
    rx: mpsc::UnboundedReceiver<ShutdownSignal>,
    forwarder: Option<JoinHandle<()>>,
}

impl ShutdownSignals {
    pub fn install() -> Result<Self> {
        let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        let mut sigquit = signal(SignalKind::quit()).context("installing SIGQUIT handler")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = sigint.recv() => ShutdownSignal::Interrupt,
                    _ = sigterm.recv() => ShutdownSignal::Terminate,
                    _ = sigquit.recv() => ShutdownSignal::Quit,
                };
                debug!(target: "shutdown", ?received, "signal received");
                if tx.send(received).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            rx,
            forwarder: Some(forwarder),
        })
    }

    /// Signals fed by hand instead of by the OS
    #[cfg(test)]
    pub(crate) fn channel() -> (mpsc::UnboundedSender<ShutdownSignal>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx, forwarder: None })
    }

    pub async fn recv(&mut self) -> Option<ShutdownSignal> {
        self.rx.recv().await
    }
}

impl Drop for ShutdownSignals {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

/// Act on every signal from `signals` until aborted. Each signal is
/// handled on its own task so a SIGQUIT can cut a grace period short.
pub fn spawn_signal_listener(
    mut signals: ShutdownSignals,
    target: Arc<dyn ShutdownTarget>,
    grace: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(received) = signals.recv().await {
            let target = target.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_signal(received, target.as_ref(), grace).await {
                    warn!(target: "shutdown", ?received, "{:#}", e);
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records calls; `alive` decides whether shutdown requests succeed
    #[derive(Default)]
    struct FakeHypervisor {
        alive: AtomicBool,
        requests: AtomicUsize,
        kills: AtomicUsize,
        log: Mutex<Vec<(&'static str, tokio::time::Instant)>>,
    }

    impl FakeHypervisor {
        fn alive() -> Arc<Self> {
            let fake = Self::default();
            fake.alive.store(true, Ordering::SeqCst);
            Arc::new(fake)
        }
    }

    #[async_trait::async_trait]
    impl ShutdownTarget for FakeHypervisor {
        async fn request_shutdown(&self) -> Result<()> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.log
                .lock()
                .unwrap()
                .push(("request", tokio::time::Instant::now()));
            if !self.alive.load(Ordering::SeqCst) {
                bail!("connection refused");
            }
            Ok(())
        }

        async fn force_kill(&self) -> Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.log
                .lock()
                .unwrap()
                .push(("kill", tokio::time::Instant::now()));
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    const GRACE: Duration = Duration::from_secs(20);

    #[tokio::test(start_paused = true)]
    async fn test_sigterm_escalates_when_guest_ignores_request() {
        let fake = FakeHypervisor::alive();
        let start = tokio::time::Instant::now();

        handle_signal(ShutdownSignal::Terminate, fake.as_ref(), GRACE)
            .await
            .unwrap();

        assert_eq!(fake.requests.load(Ordering::SeqCst), 2);
        assert_eq!(fake.kills.load(Ordering::SeqCst), 1);
        let log = fake.log.lock().unwrap();
        assert_eq!(log[0].0, "request");
        assert_eq!(log[0].1, start);
        assert_eq!(log[2].0, "kill");
        assert!(log[2].1 - start >= GRACE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sigint_no_kill_when_guest_powered_off() {
        let fake = FakeHypervisor::alive();

        let handle = tokio::spawn({
            let fake = fake.clone();
            async move { handle_signal(ShutdownSignal::Interrupt, fake.as_ref(), GRACE).await }
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        // guest honoured the power button; API socket is gone
        fake.alive.store(false, Ordering::SeqCst);

        handle.await.unwrap().unwrap();
        assert_eq!(fake.requests.load(Ordering::SeqCst), 2);
        assert_eq!(fake.kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_acts_on_each_signal() {
        let fake = FakeHypervisor::alive();
        let (tx, signals) = ShutdownSignals::channel();
        let listener = spawn_signal_listener(signals, fake.clone(), GRACE);

        tx.send(ShutdownSignal::Terminate).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fake.requests.load(Ordering::SeqCst), 1);
        assert_eq!(fake.kills.load(Ordering::SeqCst), 0);

        // SIGQUIT does not wait out the SIGTERM grace period
        tx.send(ShutdownSignal::Quit).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fake.kills.load(Ordering::SeqCst), 1);

        listener.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sigquit_kills_immediately() {
        let fake = FakeHypervisor::alive();
        let start = tokio::time::Instant::now();

        handle_signal(ShutdownSignal::Quit, fake.as_ref(), GRACE)
            .await
            .unwrap();

        assert_eq!(fake.requests.load(Ordering::SeqCst), 0);
        assert_eq!(fake.kills.load(Ordering::SeqCst), 1);
        assert_eq!(fake.log.lock().unwrap()[0].1, start);
    }
}
