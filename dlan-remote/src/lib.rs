//! Remote controller for a D-LAN core: tokio host for the dlan-core session,
//! local core launcher and download peer watch.

pub mod config;
pub mod connection;
pub mod launcher;
pub mod peer_watch;
