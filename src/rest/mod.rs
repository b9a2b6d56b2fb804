//! Read-only REST access to the spot API.

pub mod client;

pub use client::Client;
