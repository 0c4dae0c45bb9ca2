// ckv-common - Wire protocol shared by the CoordKV client and its test store
//
// This crate defines the RESP2 value model, the blocking reply reader used by
// the client, and the incremental request parser used by server-side code.

pub mod error;
pub mod resp;

// Re-export for convenience
pub use error::*;
pub use resp::*;
