//! # orbit-id
//!
//! Typed identifiers for the orbit fleet coordinator.
//!
//! Two families of IDs exist:
//!
//! - **Names** (`NodeId`): assigned by operators in the topology file and
//!   reported by agents in heartbeats. A node and the agent running on it
//!   share one `NodeId`. Names order lexicographically, and that order is the
//!   deterministic tie-break for placement.
//! - **Generated IDs** (`TaskId`, `GrantId`): minted by the coordinator as
//!   `{prefix}_{ulid}`, e.g. `task_01HV4Z2WQXKJNM8GPQY6VBKC3D`. They are
//!   sortable by creation time and roundtrip through `Display`/`FromStr`.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

// Referenced by `define_id!` expansions in other crates.
#[doc(hidden)]
pub use ulid::Ulid;
