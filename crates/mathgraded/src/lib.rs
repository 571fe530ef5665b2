//! mathgrade tool endpoint library - exposes modules for testing.

pub mod backend;
pub mod dispatch;
pub mod rpc_server;
pub mod tools;

pub use dispatch::{ToolHandler, ToolRegistry};
pub use rpc_server::{serve, EndpointState};
