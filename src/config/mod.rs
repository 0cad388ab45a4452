pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{load_config, load_validated_config};
pub use models::*;
pub use validation::{MeshConfigValidator, ValidationError, ValidationResult};
