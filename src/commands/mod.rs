pub mod spawn;
pub mod teardown;

pub use spawn::{cmd_spawn, Spawner};
pub use teardown::{run_teardown, TeardownReport, TeardownStep, TEARDOWN_ORDER};
