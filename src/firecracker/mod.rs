pub mod api;
pub mod config;
pub mod shutdown;
pub mod vm;

pub use api::FirecrackerClient;
pub use config::BootConfig;
pub use shutdown::{
    handle_signal, HypervisorControl, ShutdownSignal, ShutdownSignals, ShutdownTarget,
};
pub use vm::{FirecrackerSupervisor, Supervisor, VmManager};
