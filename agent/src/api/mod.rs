//! Control-plane API surface

pub mod client;
pub mod http;

pub use client::*;
