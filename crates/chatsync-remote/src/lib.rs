// Remote store adapter: the trait the sync engine is written against, plus
// an in-process simulation of the hosted store behind the `testing` feature.

pub mod adapter;
pub mod clock;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod transact;
#[cfg(any(test, feature = "testing"))]
pub mod tree;

pub use adapter::{
    increment, server_timestamp_placeholder, Query, RemoteStore, Snapshot, Subscription, WriteAck,
};
pub use clock::ServerClock;
#[cfg(any(test, feature = "testing"))]
pub use memory::{LoggedWrite, MemoryBackend, MemoryRemote};
pub use transact::{transact, Committed};
