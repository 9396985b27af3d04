pub mod config;
pub mod network;

pub use config::IkeDaemonConfig;
pub use network::ike::IKEError;
