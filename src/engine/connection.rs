/// Drives one player's WebSocket: the only writer to its sink and the only
/// reader of its stream. Session state changes arrive as `Outbound` frames;
/// guesses go to the session behind its lock.
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::core::protocol::{ClientMessage, ServerMessage};
use crate::engine::registry::{JoinTarget, Joined, SessionRegistry};
use crate::game::{Entrant, Outbound, PlayerLink, Seat, SessionId};

type Sink<S> = SplitSink<WebSocketStream<S>, Message>;
type Stream<S> = SplitStream<WebSocketStream<S>>;

/// What the socket gave us, reduced to what the game cares about
enum Incoming {
    Text(String),
    Closed,
    Ignored,
}

async fn next_incoming<S>(stream: &mut Stream<S>) -> Incoming
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match stream.next().await {
        Some(Ok(Message::Text(text))) => Incoming::Text(text),
        Some(Ok(Message::Close(_))) | None => Incoming::Closed,
        Some(Err(e)) => {
            debug!("WebSocket read error: {}", e);
            Incoming::Closed
        }
        Some(Ok(_)) => Incoming::Ignored,
    }
}

/// Returns false when the socket can no longer be written
async fn write_message<S>(sink: &mut Sink<S>, message: &ServerMessage) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let json = match message.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!("Dropping unserializable message: {}", e);
            return true;
        }
    };
    sink.send(Message::Text(json)).await.is_ok()
}

/// Apply one outbound instruction. Returns false once the connection is done.
async fn forward<S>(sink: &mut Sink<S>, outbound: Option<Outbound>) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match outbound {
        Some(Outbound::Message(message)) => write_message(sink, &message).await,
        Some(Outbound::Close) | None => {
            let _ = sink.close().await;
            false
        }
    }
}

/// Flush whatever is already queued, then close
async fn flush_and_close<S>(sink: &mut Sink<S>, outbound: &mut mpsc::UnboundedReceiver<Outbound>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Ok(item) = outbound.try_recv() {
        if !forward(sink, Some(item)).await {
            return;
        }
    }
    let _ = sink.close().await;
}

/// Leave while still waiting. If a pairing won the race for the registry
/// lock, the seat is already in `seat_rx`; give it up as a disconnect.
async fn abandon_wait(
    registry: &SessionRegistry,
    session_id: SessionId,
    connection: u64,
    seat_rx: &mut oneshot::Receiver<Seat>,
) {
    registry.leave(session_id, connection).await;
    if let Ok(Seat { session, index }) = seat_rx.try_recv() {
        debug!(session = %session_id, connection, player = index, "Seated after leaving");
        session.handle_disconnect(index).await;
    }
}

pub(crate) async fn serve_player<S>(
    ws: WebSocketStream<S>,
    registry: Arc<SessionRegistry>,
    target: JoinTarget,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let (link, mut outbound) = PlayerLink::channel();
    let (entrant, mut seat_rx) = Entrant::new(link);
    let connection = registry.next_connection_id();

    let joined = match registry.join(target, connection, entrant).await {
        Ok(joined) => joined,
        Err(e) => {
            info!(connection, "Refusing player: {}", e);
            write_message(&mut sink, &ServerMessage::error(e.to_string())).await;
            let _ = sink.close().await;
            return;
        }
    };
    let session_id = joined.session_id();

    if let Joined::Waiting(_) = joined {
        if !write_message(&mut sink, &ServerMessage::waiting()).await {
            abandon_wait(&registry, session_id, connection, &mut seat_rx).await;
            return;
        }
    }

    // Seat first: a seat is always handed out before the start frame is queued.
    let seat = loop {
        tokio::select! {
            biased;

            seat = &mut seat_rx => break seat.ok(),

            item = outbound.recv() => {
                if !forward(&mut sink, item).await {
                    abandon_wait(&registry, session_id, connection, &mut seat_rx).await;
                    return;
                }
            }

            incoming = next_incoming(&mut stream) => match incoming {
                Incoming::Closed => {
                    abandon_wait(&registry, session_id, connection, &mut seat_rx).await;
                    return;
                }
                Incoming::Text(_) => {
                    write_message(&mut sink, &ServerMessage::error("Waiting for an opponent")).await;
                }
                Incoming::Ignored => {}
            }
        }
    };

    let Some(Seat { session, index }) = seat else {
        // The slot expired; deliver its farewell
        flush_and_close(&mut sink, &mut outbound).await;
        return;
    };
    debug!(session = %session_id, connection, player = index, "Player seated");

    loop {
        tokio::select! {
            biased;

            item = outbound.recv() => {
                if !forward(&mut sink, item).await {
                    break;
                }
            }

            incoming = next_incoming(&mut stream) => match incoming {
                Incoming::Text(text) => match ClientMessage::parse(&text) {
                    Ok(ClientMessage::Guess { number }) => session.submit_guess(index, number).await,
                    Err(e) => {
                        debug!(session = %session_id, player = index, "{}", e);
                        write_message(&mut sink, &ServerMessage::error("Malformed message")).await;
                    }
                },
                Incoming::Closed => break,
                Incoming::Ignored => {}
            }
        }
    }

    session.handle_disconnect(index).await;
}
