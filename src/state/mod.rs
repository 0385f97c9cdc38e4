pub mod manager;
pub mod types;
pub mod utils;

pub use manager::{StateManager, VmStore};
pub use types::{VmPhase, VmRecord, VmStatus};
pub use utils::validate_uid;
