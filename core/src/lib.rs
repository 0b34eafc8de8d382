//! Core orchestration library for the conductor workspace.
//!
//! Wires together the workspace-scoped agent supervisor (E), the turn
//! orchestrator (G), and the durable services built on top of it: doc-chat
//! and spec-ingest (I), the ticket-flow engine (L), the autorunner loop (K),
//! and the generic flow/event store (M) that backs durable state for the
//! latter two.

pub mod autorunner;
pub mod config;
pub mod docchat;
pub mod doctor;
pub mod events;
pub mod flow;
pub mod lock;
pub mod orchestrator;
pub mod patch;
pub mod runlog;
pub mod snapshot;
pub mod specingest;
pub mod state;
pub mod supervisor;
pub mod threads;
pub mod tickets;
pub mod workspace;

pub use conductor_protocol::ConductorError;
pub use conductor_protocol::Result;
