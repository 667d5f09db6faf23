//! Typed ID definitions.

use crate::{define_id, define_name};

// =============================================================================
// Fleet Members
// =============================================================================

define_name!(NodeId, 63);

// =============================================================================
// Placement
// =============================================================================

define_id!(TaskId, "task");
define_id!(GrantId, "grant");
