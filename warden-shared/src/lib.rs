//! Types shared between the warden manager, its RPC surfaces, and the
//! in-machine agent.

pub mod errors;
pub mod wire;

pub use errors::{WardenError, WardenResult};
