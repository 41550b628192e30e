mod async_server;
pub mod connection;
pub mod registry;

pub use async_server::{run_async_server, serve};
pub use connection::ConnectionContext;
pub use registry::ClientRegistry;
