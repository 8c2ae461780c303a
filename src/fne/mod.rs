pub mod auth;
pub mod config;
pub mod frame;
pub mod handler;
pub mod master;
pub mod opcodes;
pub mod peer;
pub mod peer_details;
pub mod peer_registry;
pub mod system;
pub mod traffic;
pub mod transport;
