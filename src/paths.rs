use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Default base directory for all fcspawn data
pub const DEFAULT_BASE_DIR: &str = "/var/lib/fcspawn";

static BASE_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Initialize the base directory. Must be called before any other path access;
/// later calls are ignored.
pub fn init_base_dir(dir: Option<&Path>) {
    let dir = dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR));
    let _ = BASE_DIR.set(dir);
}

/// Base directory for all fcspawn data
pub fn base_dir() -> PathBuf {
    BASE_DIR
        .get()
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR))
}

/// Directory for VM records
pub fn state_dir() -> PathBuf {
    base_dir().join("state")
}

/// Directory holding an imported image's filesystem (content-addressed by id)
pub fn image_dir(image_id: &str) -> PathBuf {
    base_dir().join("image").join(image_id)
}

/// Read-only base filesystem image used as the snapshot origin
pub fn image_fs(image_id: &str) -> PathBuf {
    image_dir(image_id).join("image.ext4")
}

/// Kernel image for a kernel id
pub fn kernel_image(kernel_id: &str) -> PathBuf {
    base_dir().join("kernel").join(kernel_id).join("vmlinux")
}

/// Per-VM runtime directory (overlay, sockets, logs)
pub fn vm_dir(uid: &str) -> PathBuf {
    base_dir().join("vm").join(uid)
}

/// Per-VM writable overlay file backing the snapshot's CoW store
pub fn overlay_file(uid: &str) -> PathBuf {
    vm_dir(uid).join("overlay.dm")
}

/// Firecracker API socket
pub fn api_socket(uid: &str) -> PathBuf {
    vm_dir(uid).join("firecracker.sock")
}

/// Firecracker log FIFO
pub fn log_fifo(uid: &str) -> PathBuf {
    vm_dir(uid).join("firecracker.log")
}

/// Device-mapper name of the top-level snapshot device
pub fn snapshot_dm_name(uid: &str) -> String {
    format!("fcspawn-{}", uid)
}

/// Device-mapper name of the optional linear+zero base device
pub fn base_dm_name(uid: &str) -> String {
    format!("fcspawn-{}-base", uid)
}

/// Device node for a device-mapper name
pub fn mapper_path(dm_name: &str) -> PathBuf {
    Path::new("/dev/mapper").join(dm_name)
}
