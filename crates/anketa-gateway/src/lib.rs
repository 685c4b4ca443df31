//! HTTP surface for resumable consultation sessions.
//!
//! Serves the session routes, mints signed join credentials for the media
//! room, keeps one live agent per room and streams agent signals over SSE.

mod agent_dispatch;
mod agent_signals;
mod credentials;
mod gateway_server;

pub use agent_dispatch::{AgentDispatchRegistry, DispatchOutcome, LiveAgent};
pub use agent_signals::{AgentSignal, AgentSignalHub};
pub use credentials::{CredentialError, JoinClaims, JoinCredentialIssuer};
pub use gateway_server::{
    build_gateway_router, run_gateway_server, serve_gateway, GatewayConfig, GatewayState,
};
