//! Client engine for a tsserver-like language server.
//!
//! [`TsClient`] owns one event loop that supervises the server process,
//! pipelines requests to it, routes its events and keeps open documents and
//! their diagnostics in sync.

pub mod codec;
pub mod config;

mod buffers;
mod callbacks;
mod cancellation;
mod channel;
mod client;
mod delayer;
mod diagnostics;
mod errors;
mod events;
mod protocol;
mod queue;
mod state;
mod supervisor;
mod telemetry;
mod typings;

pub use buffers::TextDocument;
pub use cancellation::generate_pipe_name;
pub use client::{ClientEvent, SubmitOptions, TsClient};
pub use config::ClientConfig;
pub use errors::{DocumentError, PathError, ProtocolViolation, RequestError, split_server_error};
pub use protocol::Response;
pub use queue::QueueingType;
pub use supervisor::{
    CrashReport, ProcessLauncher, RestartDecision, ServerConnection, ServerLauncher,
    build_server_args, log_file_path,
};
pub use telemetry::{TelemetrySink, TracingTelemetry};
