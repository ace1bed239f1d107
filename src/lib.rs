// Library modules
pub mod client;
pub mod config;
pub mod constants;
pub mod environment;
pub mod exit_poller;
pub mod identity;
pub mod packets;
#[cfg(unix)]
pub mod poller;
pub mod retry;
pub mod session;
pub mod two_way_dict;
pub mod types;

// Re-export commonly used types
pub use client::GanglionClient;
pub use config::{default_config, load_config, App, Config};
pub use environment::{get_environment, Environment};
pub use packets::{AppAnnouncement, Packet, PacketError};
pub use retry::Retry;
pub use session::manager::SessionManager;
pub use session::{ProcessState, Session, SessionConnector};
pub use two_way_dict::TwoWayDict;
pub use types::{Meta, RouteKey, SessionId};
