/// Endpoint players ask for an opponent on. WebSocket clients get one frame
/// per response; plain HTTP `GET` clients get the same responses as a chunked
/// stream of JSON lines.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::core::config::MatchmakerConfig;
use crate::core::protocol::MatchResponse;
use crate::matchmaker::{Admission, Matchmaker, SessionProvisioner};

const MAX_REQUEST_HEAD: usize = 8 * 1024;
const REQUEST_HEAD_TIMEOUT: Duration = Duration::from_secs(5);

const CORS_HEADERS: &str = "Access-Control-Allow-Origin: *\r\n\
    Access-Control-Allow-Methods: GET, OPTIONS\r\n\
    Access-Control-Allow-Headers: Content-Type\r\n";

pub struct MatchmakerServer {
    listener: TcpListener,
    matchmaker: Arc<Matchmaker>,
}

impl MatchmakerServer {
    pub async fn bind(
        config: MatchmakerConfig,
        provisioner: Arc<dyn SessionProvisioner>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        let matchmaker = Matchmaker::new(provisioner, &config);
        Ok(Self { listener, matchmaker })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn matchmaker(&self) -> Arc<Matchmaker> {
        Arc::clone(&self.matchmaker)
    }

    pub async fn run(self) -> std::io::Result<()> {
        info!(
            "Matchmaker listening on {} (timeout {:?})",
            self.listener.local_addr()?,
            self.matchmaker.match_timeout()
        );

        loop {
            let (stream, addr) = self.listener.accept().await?;
            debug!("Match request connection from {}", addr);
            tokio::spawn(handle_connection(stream, addr, Arc::clone(&self.matchmaker)));
        }
    }
}

/// Where match responses are written to, whatever the transport
#[async_trait]
trait Responder: Send {
    /// Returns false once the client can no longer be written to
    async fn send(&mut self, response: &MatchResponse) -> bool;

    /// Resolves when the client hangs up
    async fn gone(&mut self);

    async fn finish(&mut self);
}

struct WsResponder {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    incoming: SplitStream<WebSocketStream<TcpStream>>,
}

#[async_trait]
impl Responder for WsResponder {
    async fn send(&mut self, response: &MatchResponse) -> bool {
        match response.to_json() {
            Ok(json) => self.sink.send(Message::Text(json)).await.is_ok(),
            Err(e) => {
                warn!("Dropping unserializable response: {}", e);
                true
            }
        }
    }

    async fn gone(&mut self) {
        loop {
            match self.incoming.next().await {
                Some(Ok(Message::Close(_))) | None => return,
                Some(Err(e)) => {
                    debug!("Match request socket failed: {}", e);
                    return;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    async fn finish(&mut self) {
        let _ = self.sink.close().await;
    }
}

/// Chunked `application/json` body, one response per line
struct HttpResponder {
    stream: TcpStream,
}

#[async_trait]
impl Responder for HttpResponder {
    async fn send(&mut self, response: &MatchResponse) -> bool {
        let mut line = match response.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Dropping unserializable response: {}", e);
                return true;
            }
        };
        line.push('\n');
        let chunk = format!("{:x}\r\n{}\r\n", line.len(), line);
        self.stream.write_all(chunk.as_bytes()).await.is_ok()
    }

    async fn gone(&mut self) {
        let mut buf = [0u8; 512];
        loop {
            match self.stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }

    async fn finish(&mut self) {
        let _ = self.stream.write_all(b"0\r\n\r\n").await;
        let _ = self.stream.shutdown().await;
    }
}

struct RequestHead {
    method: String,
    websocket: bool,
    len: usize,
}

fn parse_request_head(bytes: &[u8]) -> Option<RequestHead> {
    let end = bytes.windows(4).position(|w| w == b"\r\n\r\n")?;
    let text = String::from_utf8_lossy(&bytes[..end]);
    let mut lines = text.lines();
    let method = lines.next()?.split_whitespace().next()?.to_string();
    let websocket = lines.any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
        })
    });
    Some(RequestHead {
        method,
        websocket,
        len: end + 4,
    })
}

/// Look at the request head without consuming it, so a WebSocket handshake
/// can still read it.
async fn peek_request_head(stream: &TcpStream) -> std::io::Result<Option<RequestHead>> {
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if let Some(head) = parse_request_head(&buf[..n]) {
            return Ok(Some(head));
        }
        if n == buf.len() {
            return Ok(None);
        }
        // Peek returns what is buffered so far; give the rest a moment to arrive
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, matchmaker: Arc<Matchmaker>) {
    let head = match tokio::time::timeout(REQUEST_HEAD_TIMEOUT, peek_request_head(&stream)).await {
        Ok(Ok(Some(head))) => head,
        Ok(Ok(None)) | Err(_) => {
            debug!("No usable request from {}", addr);
            return;
        }
        Ok(Err(e)) => {
            debug!("Failed to read request from {}: {}", addr, e);
            return;
        }
    };

    if head.websocket {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("Failed to accept WebSocket from {}: {}", addr, e);
                return;
            }
        };
        let (sink, incoming) = ws.split();
        negotiate(WsResponder { sink, incoming }, addr, matchmaker).await;
        return;
    }

    let mut stream = stream;
    let mut consumed = vec![0u8; head.len];
    if stream.read_exact(&mut consumed).await.is_err() {
        return;
    }
    let preamble = match head.method.as_str() {
        "OPTIONS" => {
            format!("HTTP/1.1 204 No Content\r\n{CORS_HEADERS}Content-Length: 0\r\nConnection: close\r\n\r\n")
        }
        "GET" => format!(
            "HTTP/1.1 200 OK\r\n{CORS_HEADERS}Content-Type: application/json\r\n\
             Transfer-Encoding: chunked\r\nConnection: close\r\n\r\n"
        ),
        _ => format!(
            "HTTP/1.1 405 Method Not Allowed\r\n{CORS_HEADERS}Content-Length: 0\r\nConnection: close\r\n\r\n"
        ),
    };
    if stream.write_all(preamble.as_bytes()).await.is_err() || head.method != "GET" {
        let _ = stream.shutdown().await;
        return;
    }
    negotiate(HttpResponder { stream }, addr, matchmaker).await;
}

async fn negotiate<R: Responder>(mut responder: R, addr: SocketAddr, matchmaker: Arc<Matchmaker>) {
    let outcome = match matchmaker.request_match().await {
        Admission::Paired(outcome) | Admission::Rejected(outcome) => outcome,
        Admission::Waiting(ticket) => {
            // Returning early drops the ticket, which frees the slot
            if !responder.send(&MatchResponse::waiting()).await {
                return;
            }
            tokio::select! {
                outcome = ticket.wait() => outcome,
                _ = responder.gone() => {
                    info!("Waiting player {} left", addr);
                    return;
                }
            }
        }
    };

    let response = outcome.into_response();
    debug!("Answering {} with {:?}", addr, response.status);
    responder.send(&response).await;
    responder.finish().await;
}
