pub mod client;
pub mod logger;

pub use client::*;
