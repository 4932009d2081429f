/// WebSocket front door of the game engine
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::core::config::EngineConfig;
use crate::core::error::EngineError;
use crate::core::protocol::ServerMessage;
use crate::engine::connection::serve_player;
use crate::engine::registry::{JoinTarget, SessionRegistry};

pub struct EngineServer {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
}

impl EngineServer {
    pub async fn bind(config: EngineConfig) -> Result<Self, EngineError> {
        let listener = TcpListener::bind(config.bind).await?;
        let base_url = config.base_url(listener.local_addr()?);
        let registry = SessionRegistry::new(config, base_url);
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, EngineError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn run(self) -> Result<(), EngineError> {
        info!(
            "Game engine listening on {} (lobby at {})",
            self.listener.local_addr()?,
            self.registry.lobby_url()
        );

        loop {
            let (stream, addr) = self.listener.accept().await?;
            debug!("New connection from {}", addr);
            tokio::spawn(handle_connection(stream, addr, Arc::clone(&self.registry)));
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, registry: Arc<SessionRegistry>) {
    let mut path = String::new();
    let callback = |request: &Request, response: Response| {
        path = request.uri().path().to_string();
        Ok::<_, ErrorResponse>(response)
    };

    let mut ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Failed to accept WebSocket from {}: {}", addr, e);
            return;
        }
    };

    match parse_game_path(&path) {
        Ok(target) => serve_player(ws, registry, target).await,
        Err(e) => {
            info!("Rejecting {}: {}", addr, e);
            if let Ok(json) = ServerMessage::error(e.to_string()).to_json() {
                let _ = ws.send(Message::Text(json)).await;
            }
            let _ = ws.close(None).await;
        }
    }
}

/// `/game` joins the open lobby, `/game/<id>` a reserved session
pub fn parse_game_path(path: &str) -> Result<JoinTarget, EngineError> {
    let rest = path
        .strip_prefix("/game")
        .ok_or_else(|| EngineError::InvalidPath(path.to_string()))?;
    if !rest.is_empty() && !rest.starts_with('/') {
        return Err(EngineError::InvalidPath(path.to_string()));
    }

    match rest.trim_matches('/') {
        "" => Ok(JoinTarget::Lobby),
        id if !id.contains('/') => id
            .parse()
            .map(JoinTarget::Session)
            .map_err(|_| EngineError::UnknownSession(id.to_string())),
        _ => Err(EngineError::InvalidPath(path.to_string())),
    }
}
