//! Kadmesh identifier types
//!
//! Fixed-size 256-bit identifiers and the XOR metric that every other
//! Kadmesh crate orders nodes by.

pub mod error;
pub mod types;

pub use error::{ProtocolError, Result};
pub use types::{Distance, NodeId, NODE_ID_BITS, NODE_ID_SIZE};
