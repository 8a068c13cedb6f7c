//! Public tunnel: routes hostnames to stack services through an outbound
//! connection and keeps it up with capped exponential backoff.

pub mod backoff;
pub mod cloudflared;
pub mod config;
pub mod connector;
pub mod manager;

pub use backoff::{Backoff, BackoffPolicy};
pub use cloudflared::CloudflaredConnector;
pub use config::{RouteTable, RouteTarget, TunnelConfig, TunnelToken};
pub use connector::{TunnelConnector, TunnelFailure, TunnelSession};
pub use manager::{RouteCommand, TunnelHandle, TunnelManager, TunnelState, TunnelStatus};
