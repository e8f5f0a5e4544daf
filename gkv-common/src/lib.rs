// gkv-common - Shared wire definitions for GridKV
//
// This crate defines the RESP2 framing, the protocol vocabulary and the
// tagged value model spoken by the client, the locator and the grid node.

pub mod error;
pub mod protocol;
pub mod resp;
pub mod wire;

// Re-export for convenience
pub use error::*;
pub use protocol::*;
pub use resp::*;
pub use wire::*;
