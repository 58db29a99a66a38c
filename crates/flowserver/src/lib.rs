//! Channel transport for the flow engine
//!
//! A process-boundary-agnostic request/response channel with middleware and
//! broadcast, the transports that carry it, and a client for executing nodes
//! through it.

pub mod channel;
pub mod client;
pub mod engine;
pub mod transport;

pub use channel::{
    BroadcastMessage, ChannelResponse, ChannelServer, HandlerError, HandlerResult,
    LoggingMiddleware, Middleware, Next, RetryMiddleware, ValidationMiddleware,
};
pub use client::{normalize_request, ExecutionRequest, NodeExecutionClient};
pub use engine::{register_engine_handlers, spawn_event_bridge};
pub use transport::{HttpTransport, InProcessTransport, Transport, TransportError};
