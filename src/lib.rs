pub mod config;
pub mod error;
pub mod xmpp_server;
