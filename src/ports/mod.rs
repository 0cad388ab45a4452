pub mod config_manager;
pub mod transport;

pub use config_manager::{ConfigError, ConfigResult, ConfigurationManager};
pub use transport::{
    Transport, TransportError, TransportRequest, TransportResponse, TransportResult,
    decode_payload, find_header, is_json_content_type,
};
