//! Shared types for the mathgrade endpoint and its callers.
//!
//! Wire envelopes, the error taxonomy, the capability selector, the grading
//! data model, and configuration loading live here so that `mathgraded` and
//! `mathgradectl` agree on a single definition of each.

pub mod config;
pub mod error;
pub mod grading;
pub mod model_selector;
pub mod rpc;
pub mod tool_output;

pub use config::GraderConfig;
pub use error::{ToolError, TransportError};
pub use grading::{
    Degradation, FeedbackSummary, GradingMode, GradingResult, GradingStatistics, QuestionResult,
    RemedialProblem, RemedialSet, TopicStats,
};
pub use model_selector::{CapabilitySelector, Complexity, ModelSelectorConfig, TaskCategory};
pub use rpc::{
    CapabilityDescriptor, ControlMessage, EndpointAddress, Inbound, RpcRequest, RpcResponse,
    ServerInfo,
};
pub use tool_output::ToolOutput;

/// Protocol version advertised in the welcome message.
pub const PROTOCOL_VERSION: &str = "2.0";
