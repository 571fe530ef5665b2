//! mathgradectl library - caller side of the tool endpoint, exposed for
//! integration tests

pub mod image;
pub mod orchestrator;
pub mod registry;
pub mod rpc_client;
pub mod store;
pub mod worker;

pub use orchestrator::{GradeError, GradingRequest, Orchestrator};
pub use registry::ConnectionRegistry;
pub use rpc_client::{Connection, ConnectionState};
pub use worker::{GradingService, ServiceError};
