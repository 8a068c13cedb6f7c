//! Seam between the tunnel state machine and the tunnel client

use super::config::{RouteTable, TunnelToken};
use crate::error::HearthError;
use async_trait::async_trait;
use thiserror::Error;

/// Why a connection attempt or session ended
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TunnelFailure {
    /// Credentials rejected; retrying cannot help
    #[error("authentication rejected: {0}")]
    Auth(String),
    /// Network or edge trouble; worth retrying
    #[error("{0}")]
    Transient(String),
}

impl From<TunnelFailure> for HearthError {
    fn from(failure: TunnelFailure) -> Self {
        match failure {
            TunnelFailure::Auth(msg) => HearthError::TunnelAuth(msg),
            TunnelFailure::Transient(msg) => HearthError::TunnelTransient(msg),
        }
    }
}

/// Opens tunnel sessions
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    /// Establish a session publishing `routes`
    async fn connect(
        &self,
        token: &TunnelToken,
        routes: &RouteTable,
    ) -> Result<Box<dyn TunnelSession>, TunnelFailure>;
}

/// A live tunnel connection
#[async_trait]
pub trait TunnelSession: Send {
    /// Whether routes can change without reconnecting
    fn supports_route_updates(&self) -> bool;

    /// Replace the published routes on the live connection
    async fn update_routes(&mut self, routes: &RouteTable) -> Result<(), TunnelFailure>;

    /// Resolves when the connection drops
    async fn closed(&mut self) -> TunnelFailure;

    /// Close the connection
    async fn shutdown(self: Box<Self>);
}
