pub mod kv;
pub mod local_store;

pub use kv::{BatchOp, MemoryStore, PersistentStore, RocksStore};
pub use local_store::LocalStore;
