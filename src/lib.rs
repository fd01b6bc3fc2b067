//! sonar-core
//!
//! Device-side transport-and-dispatch engine for a developer-tools bridge:
//! connection lifecycle and mutual-TLS certificate enrollment, a plugin
//! registry, and the request/response dispatch protocol that multiplexes
//! plugins over one persistent socket to a desktop inspector. Plugin
//! implementations themselves (layout inspection, network proxying, …) are
//! external collaborators; this crate specifies only the interfaces they
//! consume and expose.

mod client;
pub mod config;
mod connection_manager;
pub mod context_store;
pub mod crypto;
pub mod diagnostics;
pub mod error;
mod plugin;
mod plugin_connection;
pub mod responder;
pub mod scheduler;
pub mod socket;
pub mod wire;

pub use client::Client;
pub use config::{ClientConfig, ConnectionEndpoint};
pub use connection_manager::{CertificateProvider, ConnectionManager, MessageReceiver};
pub use context_store::ContextStore;
pub use diagnostics::{DiagnosticState, StateElement, Step, StepOutcome};
pub use error::{Error, Result};
pub use plugin::Plugin;
pub use plugin_connection::{PluginConnection, Receiver};
pub use responder::{Responder, ResponseSink};
pub use scheduler::{Scheduler, WorkerScheduler};
pub use socket::{ClientIdentity, Socket, SocketEvent, SocketFactory, SocketProvider};
pub use wire::Medium;
