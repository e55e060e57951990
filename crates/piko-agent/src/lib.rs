//! Upstream-side agent
//!
//! The agent dials the piko server, registers an endpoint and serves every
//! stream the server opens by forwarding the request to a local HTTP service.
//!
//! ```no_run
//! use piko_agent::{Agent, AgentConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> piko_agent::AgentResult<()> {
//! let config = AgentConfig::new("ws://localhost:8001", "my-endpoint", "localhost:3000");
//! let agent = Agent::new(config)?;
//! agent.run(CancellationToken::new()).await
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod target;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::{AgentError, AgentResult};
pub use target::TargetClient;
