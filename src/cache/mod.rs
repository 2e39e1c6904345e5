mod key;
mod mutation;
mod persist;
mod store;

pub use key::QueryKey;
pub use mutation::{MutationPlan, OptimisticGuard};
pub use persist::PersistedCache;
pub use store::{CacheEntry, EntrySnapshot, QueryCache};
