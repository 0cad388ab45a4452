pub mod config_managers;
pub mod http_server;
pub mod transport;

/// Re-export commonly used types from adapters
pub use config_managers::{HttpConfigManager, InMemoryConfigManager};
pub use http_server::{MeshState, build_router};
pub use transport::ReqwestTransport;
