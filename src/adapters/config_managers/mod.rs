pub mod http;
pub mod memory;

pub use http::HttpConfigManager;
pub use memory::InMemoryConfigManager;
