pub mod clock;
pub mod codec;
pub mod conflicts;
pub mod errors;
pub mod invite;
pub mod models;
pub mod protocol;
pub mod scope;

pub use errors::{SyncError, SyncResult};
