pub mod account;
pub mod acme;
pub mod api;
pub mod ca;
pub mod cert;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod dns;
pub mod error;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod time;
pub mod webhook;

pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");

// As per RFC8555 Section 6.1, ACME clients supply the name and version of their HTTP library.
// Webhook receivers and the DNS API get the same identification.
pub const USER_AGENT: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    " reqwest/",
    env!("REQWEST_VERSION"),
    " ( +",
    env!("CARGO_PKG_REPOSITORY"),
    " )"
);
