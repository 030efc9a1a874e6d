//! guac-server: WebSocket gateway for guacd.
//!
//! Terminates browser WebSocket connections, decrypts the connection token
//! carried in the upgrade URL, negotiates the session with guacd and relays
//! instructions both ways until either end closes or goes quiet.

pub mod config;
pub mod gateway;
pub mod handshake;
pub mod logging;
pub mod session;
pub mod transport;

pub use config::GatewayConfig;
pub use gateway::{Gateway, GatewayEvent};
pub use session::SettingsValidator;
