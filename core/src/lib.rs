//! Warden: a multi-tenant deep-agent runtime engine.
//!
//! Modules mirror the spec's component breakdown: [`message`] and [`error`]
//! are the shared vocabulary; [`llm`] adapts backend-specific wire formats
//! behind one trait; [`sandbox`] executes tool-driven shell commands and file
//! operations per user; [`tools`] is the process-wide callable registry plus
//! the MCP bridge; [`instance`] clones per-user agent state off a shared
//! template; [`middleware`] wraps the LLM/tool call sites; [`agentloop`] is
//! the state machine that ties all of the above into one `invoke`/`resume`
//! API; [`trace`] carries the event types both the in-memory trace and the
//! process-wide SSE bus are built from.

pub mod agentloop;
pub mod error;
pub mod instance;
pub mod llm;
pub mod message;
pub mod middleware;
pub mod sandbox;
pub mod tools;
pub mod trace;

pub use error::WardenError;
pub use message::Message;
