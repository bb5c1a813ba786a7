pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod version;

pub use error::{Result, StoreError};
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{TimedStore, VersionedStore, VersionedStoreExt};
pub use version::{Version, Versioned};
