use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{SpawnConfig, DEFAULT_FIRECRACKER_BIN, DEFAULT_LOCK_PATH};

#[derive(Parser, Debug)]
#[command(
    name = "fcspawn",
    version,
    about = "Boot and supervise one Firecracker microVM from inside its sandbox container"
)]
pub struct Cli {
    /// VM uid (or name) in the metadata store
    pub vm_id: String,

    /// Base directory for VM records, images, kernels and overlays
    #[arg(long, env = "FCSPAWN_BASE_DIR")]
    pub base_dir: Option<PathBuf>,

    /// Firecracker binary
    #[arg(long, env = "FCSPAWN_FIRECRACKER", default_value = DEFAULT_FIRECRACKER_BIN)]
    pub firecracker_bin: PathBuf,

    /// Host-wide lock file serializing device-mapper changes
    #[arg(long, env = "FCSPAWN_LOCK_PATH", default_value = DEFAULT_LOCK_PATH)]
    pub lock_path: PathBuf,

    /// resolv.conf the guest DNS servers are read from
    #[arg(long, env = "FCSPAWN_RESOLV_CONF", default_value = "/etc/resolv.conf")]
    pub resolv_conf: PathBuf,

    /// Seconds to wait for container interfaces to appear
    #[arg(long, env = "FCSPAWN_NETWORK_TIMEOUT", default_value_t = 60)]
    pub network_timeout: u64,

    /// Seconds between the shutdown request and the forced kill
    #[arg(long, env = "FCSPAWN_SHUTDOWN_TIMEOUT", default_value_t = 20)]
    pub shutdown_timeout: u64,

    /// Also answer DHCPv6 on leased interfaces
    #[arg(long, env = "FCSPAWN_DHCPV6")]
    pub dhcpv6: bool,
}

impl Cli {
    pub fn spawn_config(&self) -> SpawnConfig {
        SpawnConfig {
            firecracker_bin: self.firecracker_bin.clone(),
            lock_path: self.lock_path.clone(),
            resolv_conf: self.resolv_conf.clone(),
            network_timeout: Duration::from_secs(self.network_timeout),
            graceful_shutdown_timeout: Duration::from_secs(self.shutdown_timeout),
            dhcpv6: self.dhcpv6,
            ..SpawnConfig::default()
        }
    }
}
