//! Wire-level building blocks of the shardwire driver: frame header handling,
//! request serialization, response and event parsing, and the typed errors
//! a server can report.

pub mod errors;
pub mod frame;
pub mod value;

pub use crate::frame::response::Response;
pub use crate::frame::types::{Consistency, SerialConsistency};
pub use crate::frame::ProtocolVersion;
