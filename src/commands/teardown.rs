//! Ordered teardown after the hypervisor returns.
//!
//! The record is saved only by the last step, so anyone reading the store
//! during teardown still sees a consistent running VM, and the single final
//! save never carries addresses or ports for a VM that is gone.

use anyhow::Result;
use tracing::{info, warn};

use crate::state::{VmRecord, VmStore};
use crate::storage::SnapshotChain;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    ClearPorts,
    ClearIpAddresses,
    DeactivateStorage,
    Persist,
}

impl std::fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeardownStep::ClearPorts => write!(f, "clear ports"),
            TeardownStep::ClearIpAddresses => write!(f, "clear IP addresses"),
            TeardownStep::DeactivateStorage => write!(f, "deactivate storage"),
            TeardownStep::Persist => write!(f, "persist stopped state"),
        }
    }
}

/// Execution order. Persist stays last.
pub const TEARDOWN_ORDER: [TeardownStep; 4] = [
    TeardownStep::ClearPorts,
    TeardownStep::ClearIpAddresses,
    TeardownStep::DeactivateStorage,
    TeardownStep::Persist,
];

#[derive(Debug, Default)]
pub struct TeardownReport {
    pub completed: Vec<TeardownStep>,
    pub failed: Vec<(TeardownStep, anyhow::Error)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// All failures folded into one error, if any
    pub fn into_result(self) -> Result<()> {
        if self.failed.is_empty() {
            return Ok(());
        }
        let detail = self
            .failed
            .iter()
            .map(|(step, e)| format!("{}: {:#}", step, e))
            .collect::<Vec<_>>()
            .join("; ");
        anyhow::bail!("teardown incomplete: {}", detail)
    }
}

async fn run_step(
    step: TeardownStep,
    record: &mut VmRecord,
    storage: &SnapshotChain,
    store: &dyn VmStore,
) -> Result<()> {
    match step {
        TeardownStep::ClearPorts => record.clear_ports(),
        TeardownStep::ClearIpAddresses => record.clear_ip_addresses(),
        TeardownStep::DeactivateStorage => storage.deactivate().await?,
        TeardownStep::Persist => {
            record.mark_stopped();
            store.save(record).await?;
        }
    }
    Ok(())
}

/// Run every step in [`TEARDOWN_ORDER`]. A failing step is logged and the
/// rest still run; the final save is always attempted.
pub async fn run_teardown(
    record: &mut VmRecord,
    storage: &SnapshotChain,
    store: &dyn VmStore,
) -> TeardownReport {
    let mut report = TeardownReport::default();

    for step in TEARDOWN_ORDER {
        match run_step(step, record, storage, store).await {
            Ok(()) => report.completed.push(step),
            Err(e) => {
                warn!(vm_id = %record.uid(), %step, "teardown step failed: {:#}", e);
                report.failed.push((step, e));
            }
        }
    }

    info!(
        vm_id = %record.uid(),
        failed = report.failed.len(),
        "teardown finished"
    );
    report
}
