pub mod credentials;
pub mod paths;
pub mod pool;

pub use credentials::{CredentialConfig, ResolvedCredential, API_KEYS_ENV};
pub use paths::ConfigPaths;
pub use pool::PoolConfig;
