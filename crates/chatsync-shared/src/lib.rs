// Types shared by every chatsync crate: identifiers, the domain model, the
// JSON records exchanged with the hosted store, and the error taxonomy.

pub mod constants;
pub mod error;
pub mod model;
pub mod paths;
pub mod record;
pub mod types;

pub use error::{SyncError, SyncResult};
pub use model::*;
pub use types::*;
