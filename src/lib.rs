pub mod config;
pub mod registry;
pub mod server;

pub use config::Config;
pub use registry::{index_entry_path, RegistryIndex};
pub use server::CargitServer;
