//! podssh-gateway: SSH front door for Kubernetes pods
//!
//! Accepts SSH logins of the form `principal@workload.namespace`,
//! authenticates them against the service account's authorized-key
//! annotation and bridges each session channel into a remote process in
//! the target pod, executed while impersonating that service account.

pub mod auth;
pub mod bridge;
pub mod command;
pub mod connection;
pub mod directory;
pub mod ratelimit;
pub mod resize;
pub mod server;
pub mod session;
pub mod state;

pub use ratelimit::RateLimiter;
pub use session::SessionOrchestrator;
pub use state::GatewayState;
