pub mod conflict;
pub mod connectivity;
pub mod coordinator;
pub mod persist;
pub mod queue;
pub mod remote;

pub use conflict::{
    merge_chunks, ConflictCheck, ConflictType, Resolution, ResolutionStrategy, SyncConflict,
};
pub use connectivity::ConnectivityMonitor;
pub use coordinator::{DeadLetter, DispatchStrategy, SyncConfig, SyncCoordinator, SyncStats};
pub use queue::OpQueue;
pub use remote::{MockRemoteStore, RemoteStore};
