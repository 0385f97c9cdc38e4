use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::network::PortMapping;

/// A VM record as kept by the metadata store.
///
/// The supervisor only mutates `status` (and reads `metadata`/`spec`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub metadata: ObjectMeta,
    pub spec: VmSpec,
    #[serde(default)]
    pub status: VmStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Stable unique id; device-mapper and on-disk names derive from it
    pub uid: String,
    pub name: String,
    /// Arbitrary key/value annotations (interface modes live here)
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    pub image: OciRef,
    pub kernel: KernelSpec,
    pub cpus: u8,
    pub memory_mib: u32,
    /// Requested size of the writable root disk
    pub disk_size_bytes: u64,
    #[serde(default)]
    pub network: VmNetworkSpec,
    /// Whether SSH access was provisioned into the image
    #[serde(default)]
    pub ssh: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciRef {
    pub oci: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelSpec {
    pub oci: String,
    pub cmd_line: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmNetworkSpec {
    /// Declared port mappings
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmStatus {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub runtime: Option<RuntimeStatus>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub network: Option<NetworkStatus>,
    #[serde(default)]
    pub image: ContentRef,
    #[serde(default)]
    pub kernel: ContentRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStatus {
    /// Id of the sandbox container this supervisor runs in
    pub id: String,
}

/// Runtime network state, only meaningful while `running` is set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkStatus {
    #[serde(default)]
    pub ip_addresses: Vec<Ipv4Addr>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

/// Reference to imported content (image or kernel) by id
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub size_bytes: u64,
}

/// Lifecycle phase as observed from a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmPhase {
    Created,
    Running,
    Stopped,
}

impl std::fmt::Display for VmPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmPhase::Created => write!(f, "created"),
            VmPhase::Running => write!(f, "running"),
            VmPhase::Stopped => write!(f, "stopped"),
        }
    }
}

impl VmRecord {
    pub fn uid(&self) -> &str {
        &self.metadata.uid
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn phase(&self) -> VmPhase {
        if self.status.running {
            VmPhase::Running
        } else if self.status.start_time.is_some() {
            VmPhase::Stopped
        } else {
            VmPhase::Created
        }
    }

    /// Transition to running: records the lease addresses and copies the
    /// declared ports into the runtime status.
    pub fn mark_running(&mut self, ip_addresses: Vec<Ipv4Addr>, now: DateTime<Utc>) {
        self.status.running = true;
        self.status.start_time = Some(now);
        self.status.network = Some(NetworkStatus {
            ip_addresses,
            ports: self.spec.network.ports.clone(),
        });
    }

    pub fn clear_ports(&mut self) {
        if let Some(network) = self.status.network.as_mut() {
            network.ports.clear();
        }
    }

    pub fn clear_ip_addresses(&mut self) {
        if let Some(network) = self.status.network.as_mut() {
            network.ip_addresses.clear();
        }
    }

    pub fn mark_stopped(&mut self) {
        self.status.running = false;
    }

    pub fn ip_addresses(&self) -> &[Ipv4Addr] {
        self.status
            .network
            .as_ref()
            .map(|n| n.ip_addresses.as_slice())
            .unwrap_or_default()
    }

    pub fn runtime_ports(&self) -> &[PortMapping] {
        self.status
            .network
            .as_ref()
            .map(|n| n.ports.as_slice())
            .unwrap_or_default()
    }
}
