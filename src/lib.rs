//! dnsguard - a filtering DNS forwarding proxy

pub mod access;
pub mod cache;
pub mod config;
pub mod dhcp;
pub mod dns_server;
pub mod filtering;
pub mod listener;
pub mod msg;
pub mod pipeline;
pub mod querylog;
pub mod ratelimit;
pub mod reload;
pub mod stats;
pub mod types;
pub mod upstream;

pub use dns_server::Server;
