pub mod device;
pub mod lock;
pub mod overlay;
pub mod snapshot;
pub mod tools;

pub use device::{BlockDevice, LoopDevice, MapperDevice, PhysicalDevice};
pub use lock::HostLock;
pub use overlay::{base_image_size, ensure_overlay};
pub use snapshot::SnapshotChain;
pub use tools::{DeviceTools, HostTools};
