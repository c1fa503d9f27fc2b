pub mod rollback;

mod process;

pub use process::{force_kill, is_process_alive};
pub use rollback::Rollback;
