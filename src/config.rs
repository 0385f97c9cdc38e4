//! Runtime configuration for a single supervisor invocation.
//!
//! Every knob has a default; the CLI layer overrides them from flags or
//! environment variables. Nothing here is persisted.

use std::path::PathBuf;
use std::time::Duration;

/// Default Firecracker binary
pub const DEFAULT_FIRECRACKER_BIN: &str = "/usr/local/bin/firecracker";

/// Host-wide lock serializing device-mapper create/remove across processes
pub const DEFAULT_LOCK_PATH: &str = "/var/lock/fcspawn-snapshot.lock";

/// dm-snapshot chunk size in 512-byte sectors (4 KiB)
pub const DEFAULT_CHUNK_SECTORS: u32 = 8;

#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub firecracker_bin: PathBuf,
    pub lock_path: PathBuf,
    pub resolv_conf: PathBuf,
    /// Interval between interface discovery attempts
    pub network_poll_interval: Duration,
    /// Give up on interface discovery after this long
    pub network_timeout: Duration,
    /// Wait between the first power-button request and the liveness probe
    pub graceful_shutdown_timeout: Duration,
    pub snapshot_chunk_sectors: u32,
    /// Also answer DHCPv6 on every leased interface
    pub dhcpv6: bool,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            firecracker_bin: PathBuf::from(DEFAULT_FIRECRACKER_BIN),
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            network_poll_interval: Duration::from_secs(1),
            network_timeout: Duration::from_secs(60),
            graceful_shutdown_timeout: Duration::from_secs(20),
            snapshot_chunk_sectors: DEFAULT_CHUNK_SECTORS,
            dhcpv6: false,
        }
    }
}
