mod connection;
mod execution_repository;
mod host_directory;
mod key_directory;
mod ownership_repository;
mod pool_store;

pub use connection::establish_connection;
pub use execution_repository::ExecutionRepository;
pub use host_directory::{HostDirectory, StaticHostDirectory};
pub use key_directory::{KeyDirectory, KeyMaterialProvider};
pub use ownership_repository::{AuthorizationStore, OwnershipRepository};
pub use pool_store::{MemoryPoolStore, PoolStore, SqlitePoolStore};

pub type DbPool = sqlx::SqlitePool;
