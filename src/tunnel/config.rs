//! Tunnel credentials and route table

use super::backoff::BackoffPolicy;
use crate::error::{HearthError, Result};
use crate::manifest::{Protocol, ServiceRegistry, TunnelSection};
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Default tunnel client binary
pub const DEFAULT_BINARY: &str = "cloudflared";

#[derive(Deserialize)]
struct TokenPayload {
    #[serde(rename = "a")]
    account: String,
    #[serde(rename = "t")]
    tunnel_id: String,
    #[serde(rename = "s")]
    secret: String,
}

/// A decoded tunnel token
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelToken {
    raw: String,
    tunnel_id: String,
}

impl TunnelToken {
    /// Decode and validate; a malformed token is an authentication failure
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let bytes = STANDARD
            .decode(raw)
            .or_else(|_| URL_SAFE.decode(raw))
            .or_else(|_| URL_SAFE_NO_PAD.decode(raw))
            .map_err(|_| HearthError::TunnelAuth("token is not valid base64".to_string()))?;
        let payload: TokenPayload = serde_json::from_slice(&bytes).map_err(|_| {
            HearthError::TunnelAuth("token does not contain tunnel credentials".to_string())
        })?;
        if payload.account.is_empty() || payload.tunnel_id.is_empty() || payload.secret.is_empty() {
            return Err(HearthError::TunnelAuth(
                "token has empty credential fields".to_string(),
            ));
        }

        Ok(Self {
            raw: raw.to_string(),
            tunnel_id: payload.tunnel_id,
        })
    }

    /// The token as given, for handing to the tunnel client
    pub fn expose(&self) -> &str {
        &self.raw
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }
}

impl std::fmt::Debug for TunnelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelToken")
            .field("tunnel_id", &self.tunnel_id)
            .field("secret", &"********")
            .finish()
    }
}

/// Where a hostname's traffic goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteTarget {
    /// Stack service behind the route, if any
    pub service: Option<String>,
    /// Origin URL
    pub url: String,
}

/// Hostname to target mapping; each hostname has exactly one target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteTable {
    routes: BTreeMap<String, RouteTarget>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a route; returns the previous target
    pub fn insert(&mut self, hostname: &str, target: RouteTarget) -> Option<RouteTarget> {
        self.routes.insert(hostname.to_ascii_lowercase(), target)
    }

    /// Remove a route
    pub fn remove(&mut self, hostname: &str) -> Option<RouteTarget> {
        self.routes.remove(&hostname.to_ascii_lowercase())
    }

    pub fn get(&self, hostname: &str) -> Option<&RouteTarget> {
        self.routes.get(&hostname.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RouteTarget)> {
        self.routes.iter().map(|(h, t)| (h.as_str(), t))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Stack services that routes point at
    pub fn target_services(&self) -> BTreeSet<String> {
        self.routes
            .values()
            .filter_map(|t| t.service.clone())
            .collect()
    }
}

/// Everything the tunnel manager needs
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Raw token; validated when the manager starts
    pub token: String,
    pub routes: RouteTable,
    pub binary: String,
    pub backoff: BackoffPolicy,
}

impl TunnelConfig {
    /// Build from the manifest's `tunnel:` block
    pub fn from_section(
        section: &TunnelSection,
        registry: &ServiceRegistry,
        token: Option<&str>,
        backoff: BackoffPolicy,
    ) -> Result<Self> {
        let token = section
            .token
            .as_deref()
            .or(token)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| HearthError::MissingConfiguration {
                keys: vec![crate::config::settings::TUNNEL_TOKEN_KEY.to_string()],
            })?
            .to_string();

        let mut routes = RouteTable::new();
        for route in &section.routes {
            if route.hostname.trim().is_empty() {
                return Err(HearthError::InvalidConfig(
                    "tunnel route with empty hostname".to_string(),
                ));
            }

            if let Some(service) = &route.service {
                if !registry.contains(service) {
                    return Err(HearthError::InvalidConfig(format!(
                        "tunnel route {} points at unknown service '{}'",
                        route.hostname, service
                    )));
                }
            }

            let target = match (&route.target, &route.service) {
                (Some(url), service) => RouteTarget {
                    service: service.clone(),
                    url: url.clone(),
                },
                (None, Some(service)) => RouteTarget {
                    service: Some(service.clone()),
                    url: published_origin(registry, service, route.port).ok_or_else(|| {
                        HearthError::InvalidConfig(format!(
                            "tunnel route {} needs a published port of service '{}'{}",
                            route.hostname,
                            service,
                            route.port.map(|p| format!(" for container port {}", p)).unwrap_or_default()
                        ))
                    })?,
                },
                (None, None) => {
                    return Err(HearthError::InvalidConfig(format!(
                        "tunnel route {} needs a service or a target",
                        route.hostname
                    )))
                }
            };

            if routes.insert(&route.hostname, target).is_some() {
                return Err(HearthError::InvalidConfig(format!(
                    "hostname {} is routed more than once",
                    route.hostname
                )));
            }
        }

        Ok(Self {
            token,
            routes,
            binary: section
                .binary
                .clone()
                .unwrap_or_else(|| DEFAULT_BINARY.to_string()),
            backoff,
        })
    }
}

/// Host-side origin of a service: the tunnel client runs on the host, outside
/// the stack network, so it reaches services through their published ports
fn published_origin(registry: &ServiceRegistry, service: &str, port: Option<u16>) -> Option<String> {
    let descriptor = registry.get(service).ok()?;
    let binding = descriptor
        .ports
        .iter()
        .filter(|p| p.protocol == Protocol::Tcp)
        .find(|p| port.map_or(true, |port| p.container == port))?;
    let host = match binding.host_ip.as_deref() {
        None | Some("0.0.0.0") | Some("") => "127.0.0.1",
        Some("::") => "[::1]",
        Some(ip) if ip.contains(':') => return Some(format!("http://[{}]:{}", ip, binding.host)),
        Some(ip) => ip,
    };
    Some(format!("http://{}:{}", host, binding.host))
}

#[cfg(test)]
pub(crate) fn test_token() -> String {
    STANDARD.encode(r#"{"a":"acct","t":"6ff42ae2-765d-4adf-8112-31c55c1551ef","s":"c2VjcmV0"}"#)
}
