pub mod registry;
pub mod slot;
pub mod transaction;

pub use registry::{CheckOutFailure, HandleId, HandleRegistry};
pub use slot::HandleSlot;
