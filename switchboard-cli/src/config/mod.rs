mod loader;
mod types;

pub use loader::ConfigLoader;
pub use types::{CredentialBackend, KEYRING_SERVICE, SwitchboardConfig};
