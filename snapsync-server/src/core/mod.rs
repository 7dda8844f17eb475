pub mod store;

pub use store::{Engine, KvIterator, MemorySnapshot, MemoryStore, Snapshot, SnapshotHandle};
