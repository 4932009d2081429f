/// Where matched players are sent, and who decides it
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::config::{AllocatorConfig, FleetTarget};
use crate::core::error::ProvisionError;
use crate::engine::SessionRegistry;

/// A game-session URL handed to both players of a match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLocation(String);

impl SessionLocation {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn from_host_port(host: &str, port: u16) -> Self {
        Self(format!("ws://{host}:{port}/game"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for SessionLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produces a session for a freshly paired couple. Called once per pairing
/// and never retried; an error fails the pairing for both players.
#[async_trait]
pub trait SessionProvisioner: Send + Sync {
    async fn provision(&self) -> Result<SessionLocation, ProvisionError>;
}

/// Every match goes to the same engine lobby
pub struct StaticLocation {
    location: SessionLocation,
}

impl StaticLocation {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: SessionLocation::new(location),
        }
    }
}

#[async_trait]
impl SessionProvisioner for StaticLocation {
    async fn provision(&self) -> Result<SessionLocation, ProvisionError> {
        Ok(self.location.clone())
    }
}

/// Reserves a dedicated session on an engine in the same process
pub struct LocalEngine {
    registry: Arc<SessionRegistry>,
}

impl LocalEngine {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl SessionProvisioner for LocalEngine {
    async fn provision(&self) -> Result<SessionLocation, ProvisionError> {
        let id = self.registry.reserve().await;
        Ok(SessionLocation::new(self.registry.session_url(id)))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    fleet_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alias_id: Option<&'a str>,
    location: &'a str,
    maximum_player_session_count: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    #[serde(default)]
    game_session_id: Option<String>,
    #[serde(default)]
    ip_address: Option<String>,
    #[serde(default)]
    port: Option<u16>,
}

/// Asks an external game-hosting allocator to start a fresh engine per match
pub struct HttpAllocator {
    client: reqwest::Client,
    config: AllocatorConfig,
}

impl HttpAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl SessionProvisioner for HttpAllocator {
    async fn provision(&self) -> Result<SessionLocation, ProvisionError> {
        let (fleet_id, alias_id) = match &self.config.target {
            FleetTarget::Fleet(id) => (Some(id.as_str()), None),
            FleetTarget::Alias(id) => (None, Some(id.as_str())),
        };
        let request = CreateSessionRequest {
            fleet_id,
            alias_id,
            location: &self.config.location,
            maximum_player_session_count: self.config.max_players,
        };
        info!(
            fleet = ?self.config.target,
            location = %self.config.location,
            "Creating game session"
        );

        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Allocator refused to create a session");
            return Err(ProvisionError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let created: CreateSessionResponse = response.json().await?;
        let ip = created.ip_address.ok_or(ProvisionError::Incomplete("ipAddress"))?;
        let port = created.port.ok_or(ProvisionError::Incomplete("port"))?;
        info!(
            session = created.game_session_id.as_deref().unwrap_or("unknown"),
            %ip,
            port,
            "Game session created"
        );
        Ok(SessionLocation::from_host_port(&ip, port))
    }
}
