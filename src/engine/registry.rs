/// Sessions hosted by one engine process, keyed by id.
///
/// A slot is created either by a reservation (matchmaker hands out
/// `/game/<id>`) or on demand for the open lobby (`/game`). It holds at most
/// one waiting player until the second arrives, at which point the game is
/// launched in place. Finished games are dropped and reported.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::core::config::EngineConfig;
use crate::core::error::EngineError;
use crate::core::protocol::{EndReason, Outcome, ServerMessage};
use crate::game::{Duel, Entrant, GameSession, SessionId, SessionReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinTarget {
    /// Pair with whoever else connects without a session id
    Lobby,
    Session(SessionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Joined {
    /// First one in; wait for a seat
    Waiting(SessionId),
    /// Second one in; the game has started
    Launched(SessionId),
}

impl Joined {
    pub fn session_id(&self) -> SessionId {
        match self {
            Joined::Waiting(id) | Joined::Launched(id) => *id,
        }
    }
}

struct Waiter {
    connection: u64,
    entrant: Entrant,
}

enum Slot {
    Awaiting {
        waiter: Option<Waiter>,
        lobby: bool,
        expiry: JoinHandle<()>,
    },
    Running(Arc<GameSession>),
}

#[derive(Default)]
struct Slots {
    slots: HashMap<SessionId, Slot>,
    lobby: Option<SessionId>,
}

pub struct SessionRegistry {
    config: EngineConfig,
    base_url: String,
    slots: Mutex<Slots>,
    reports: broadcast::Sender<SessionReport>,
    next_connection: AtomicU64,
}

impl SessionRegistry {
    pub fn new(config: EngineConfig, base_url: String) -> Arc<Self> {
        let (reports, _) = broadcast::channel(64);
        Arc::new(Self {
            config,
            base_url,
            slots: Mutex::new(Slots::default()),
            reports,
            next_connection: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// URL of the shared lobby
    pub fn lobby_url(&self) -> String {
        format!("{}/game", self.base_url)
    }

    pub fn session_url(&self, id: SessionId) -> String {
        format!("{}/game/{id}", self.base_url)
    }

    pub fn subscribe_reports(&self) -> broadcast::Receiver<SessionReport> {
        self.reports.subscribe()
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn running_sessions(&self) -> usize {
        let slots = self.slots.lock().await;
        slots
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Running(_)))
            .count()
    }

    pub async fn awaiting_sessions(&self) -> usize {
        let slots = self.slots.lock().await;
        slots
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Awaiting { .. }))
            .count()
    }

    /// Set aside an empty session for a pair that is about to connect
    pub async fn reserve(self: &Arc<Self>) -> SessionId {
        let mut slots = self.slots.lock().await;
        let id = SessionId::new();
        let slot = self.awaiting_slot(id, false);
        slots.slots.insert(id, slot);
        info!(session = %id, "Session reserved");
        id
    }

    pub async fn join(
        self: &Arc<Self>,
        target: JoinTarget,
        connection: u64,
        entrant: Entrant,
    ) -> Result<Joined, EngineError> {
        let mut slots = self.slots.lock().await;

        let id = match target {
            JoinTarget::Session(id) => id,
            JoinTarget::Lobby => match slots.lobby {
                Some(id) => id,
                None => {
                    let id = SessionId::new();
                    let slot = self.awaiting_slot(id, true);
                    slots.slots.insert(id, slot);
                    slots.lobby = Some(id);
                    id
                }
            },
        };

        match slots.slots.get_mut(&id) {
            None => return Err(EngineError::UnknownSession(id.to_string())),
            Some(Slot::Running(_)) => return Err(EngineError::SessionFull),
            Some(Slot::Awaiting { waiter, .. }) if waiter.is_none() => {
                *waiter = Some(Waiter { connection, entrant });
                info!(session = %id, connection, "Player waiting for an opponent");
                return Ok(Joined::Waiting(id));
            }
            Some(Slot::Awaiting { .. }) => {}
        }

        let Some(Slot::Awaiting { waiter: Some(first), lobby, expiry }) = slots.slots.remove(&id)
        else {
            return Err(EngineError::SessionFull);
        };
        expiry.abort();
        if lobby {
            slots.lobby = None;
        }

        let (report_tx, report_rx) = oneshot::channel();
        let duel = Duel::new(&mut rand::rng());
        let session = GameSession::launch(
            id,
            duel,
            [first.entrant, entrant],
            self.config.turn_timeout,
            report_tx,
        )
        .await;
        slots.slots.insert(id, Slot::Running(session));
        self.reap_when_done(id, report_rx);

        info!(session = %id, first = first.connection, second = connection, "Players paired");
        Ok(Joined::Launched(id))
    }

    /// A waiting connection went away before being seated
    pub async fn leave(&self, id: SessionId, connection: u64) {
        let mut slots = self.slots.lock().await;

        let Some(Slot::Awaiting { waiter, lobby, .. }) = slots.slots.get_mut(&id) else {
            return;
        };
        if waiter.as_ref().map(|w| w.connection) != Some(connection) {
            return;
        }
        *waiter = None;
        let lobby = *lobby;
        info!(session = %id, connection, "Waiting player left");

        // Lobby slots exist only for their waiter; reserved ones wait for the partner.
        if lobby {
            if let Some(Slot::Awaiting { expiry, .. }) = slots.slots.remove(&id) {
                expiry.abort();
            }
            slots.lobby = None;
        }
    }

    fn awaiting_slot(self: &Arc<Self>, id: SessionId, lobby: bool) -> Slot {
        let registry = Arc::clone(self);
        let timeout = self.config.join_timeout;
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            registry.expire(id).await;
        });
        Slot::Awaiting {
            waiter: None,
            lobby,
            expiry,
        }
    }

    async fn expire(&self, id: SessionId) {
        let mut slots = self.slots.lock().await;

        if !matches!(slots.slots.get(&id), Some(Slot::Awaiting { .. })) {
            return;
        }
        let Some(Slot::Awaiting { waiter, lobby, .. }) = slots.slots.remove(&id) else {
            return;
        };
        if lobby {
            slots.lobby = None;
        }

        match waiter {
            Some(waiter) => {
                let seconds = self.config.join_timeout.as_secs();
                info!(session = %id, connection = waiter.connection, "No opponent arrived");
                waiter.entrant.link.send(ServerMessage::End {
                    message: format!(
                        "No opponent connected within {seconds} seconds. You win by default!"
                    ),
                    outcome: Outcome::Win,
                    reason: EndReason::Forfeit,
                    target: None,
                });
                waiter.entrant.link.close();
            }
            None => debug!(session = %id, "Unused reservation expired"),
        }
    }

    fn reap_when_done(self: &Arc<Self>, id: SessionId, report: oneshot::Receiver<SessionReport>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let report = report.await;
            registry.slots.lock().await.slots.remove(&id);
            if let Ok(report) = report {
                debug!(session = %id, winner = report.winner, turns = report.turns, "Session removed");
                let _ = registry.reports.send(report);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{Outbound, PlayerLink, Seat};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn registry() -> Arc<SessionRegistry> {
        SessionRegistry::new(EngineConfig::default(), "ws://127.0.0.1:8081".to_string())
    }

    fn entrant() -> (Entrant, mpsc::UnboundedReceiver<Outbound>, oneshot::Receiver<Seat>) {
        let (link, rx) = PlayerLink::channel();
        let (entrant, seat) = Entrant::new(link);
        (entrant, rx, seat)
    }

    #[tokio::test(start_paused = true)]
    async fn lobby_pairs_the_first_two_callers() {
        let registry = registry();
        let (a, _rx_a, seat_a) = entrant();
        let (b, _rx_b, seat_b) = entrant();

        let first = registry.join(JoinTarget::Lobby, 1, a).await.unwrap();
        assert!(matches!(first, Joined::Waiting(_)));
        let second = registry.join(JoinTarget::Lobby, 2, b).await.unwrap();
        assert_eq!(second, Joined::Launched(first.session_id()));

        let seat_a = seat_a.await.unwrap();
        let seat_b = seat_b.await.unwrap();
        assert_eq!((seat_a.index, seat_b.index), (0, 1));
        assert_eq!(seat_a.session.id(), first.session_id());
        assert_eq!(registry.running_sessions().await, 1);

        // The next lobby caller starts a fresh session
        let (c, _rx_c, _seat_c) = entrant();
        let third = registry.join(JoinTarget::Lobby, 3, c).await.unwrap();
        assert!(matches!(third, Joined::Waiting(id) if id != first.session_id()));
    }

    #[tokio::test(start_paused = true)]
    async fn running_session_refuses_a_third_player() {
        let registry = registry();
        let id = registry.reserve().await;
        let (a, _rx_a, _seat_a) = entrant();
        let (b, _rx_b, _seat_b) = entrant();
        registry.join(JoinTarget::Session(id), 1, a).await.unwrap();
        registry.join(JoinTarget::Session(id), 2, b).await.unwrap();

        let (c, _rx_c, _seat_c) = entrant();
        let err = registry.join(JoinTarget::Session(id), 3, c).await.unwrap_err();
        assert!(matches!(err, EngineError::SessionFull));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_session_is_refused() {
        let registry = registry();
        let (a, _rx_a, _seat_a) = entrant();
        let err = registry
            .join(JoinTarget::Session(SessionId::new()), 1, a)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownSession(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn lone_player_wins_by_default_after_join_timeout() {
        let registry = registry();
        let (a, mut rx_a, seat_a) = entrant();
        registry.join(JoinTarget::Lobby, 1, a).await.unwrap();

        tokio::time::sleep(registry.config().join_timeout + Duration::from_secs(1)).await;

        match rx_a.try_recv().unwrap() {
            Outbound::Message(ServerMessage::End { outcome, reason, message, .. }) => {
                assert_eq!(outcome, Outcome::Win);
                assert_eq!(reason, EndReason::Forfeit);
                assert!(message.contains("10 seconds"));
            }
            other => panic!("expected forfeit end, got {other:?}"),
        }
        assert_eq!(rx_a.try_recv().unwrap(), Outbound::Close);
        assert!(seat_a.await.is_err());
        assert_eq!(registry.awaiting_sessions().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unused_reservation_expires() {
        let registry = registry();
        let id = registry.reserve().await;
        assert_eq!(registry.awaiting_sessions().await, 1);

        tokio::time::sleep(registry.config().join_timeout * 2).await;
        assert_eq!(registry.awaiting_sessions().await, 0);

        let (a, _rx_a, _seat_a) = entrant();
        assert!(registry.join(JoinTarget::Session(id), 1, a).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_the_lobby_frees_it() {
        let registry = registry();
        let (a, _rx_a, _seat_a) = entrant();
        let waiting = registry.join(JoinTarget::Lobby, 1, a).await.unwrap();

        // Someone else's connection id is not allowed to evict the waiter
        registry.leave(waiting.session_id(), 99).await;
        assert_eq!(registry.awaiting_sessions().await, 1);

        registry.leave(waiting.session_id(), 1).await;
        assert_eq!(registry.awaiting_sessions().await, 0);

        let (b, _rx_b, _seat_b) = entrant();
        let next = registry.join(JoinTarget::Lobby, 2, b).await.unwrap();
        assert!(matches!(next, Joined::Waiting(id) if id != waiting.session_id()));
    }

    #[tokio::test(start_paused = true)]
    async fn finished_sessions_are_reported_and_removed() {
        let registry = registry();
        let mut reports = registry.subscribe_reports();
        let (a, _rx_a, seat_a) = entrant();
        let (b, _rx_b, _seat_b) = entrant();
        registry.join(JoinTarget::Lobby, 1, a).await.unwrap();
        let joined = registry.join(JoinTarget::Lobby, 2, b).await.unwrap();

        let seat = seat_a.await.unwrap();
        seat.session.handle_disconnect(seat.index).await;

        let report = reports.recv().await.unwrap();
        assert_eq!(report.id, joined.session_id());
        assert_eq!(report.winner, 1);
        assert_eq!(report.reason, EndReason::Disconnect);
        assert_eq!(registry.running_sessions().await, 0);
    }

    #[tokio::test]
    async fn waiter_leaving_during_pairing_hands_the_win_to_the_opponent() {
        use crate::engine::connection::serve_player;
        use futures_util::StreamExt;
        use tokio_tungstenite::tungstenite::protocol::Role;
        use tokio_tungstenite::WebSocketStream;

        let registry = registry();
        let (client_io, server_io) = tokio::io::duplex(4096);
        let driver = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move {
                let ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
                serve_player(ws, registry, JoinTarget::Lobby).await;
            }
        });
        let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        assert!(client.next().await.is_some());

        // The second join takes the lock ahead of the waiter's leave
        let held = registry.slots.lock().await;
        let (b, mut rx_b, _seat_b) = entrant();
        let pairing = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.join(JoinTarget::Lobby, 99, b).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        client.close(None).await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        drop(held);

        assert!(matches!(pairing.await.unwrap(), Ok(Joined::Launched(_))));
        driver.await.unwrap();

        assert!(matches!(
            rx_b.recv().await,
            Some(Outbound::Message(ServerMessage::Start { .. }))
        ));
        match rx_b.recv().await {
            Some(Outbound::Message(ServerMessage::End { outcome, reason, .. })) => {
                assert_eq!(outcome, Outcome::Win);
                assert_eq!(reason, EndReason::Disconnect);
            }
            other => panic!("expected a disconnect win, got {other:?}"),
        }
        assert_eq!(rx_b.recv().await, Some(Outbound::Close));
    }

    #[test]
    fn urls_point_at_the_game_path() {
        let registry = registry();
        let id = SessionId::new();
        assert_eq!(registry.lobby_url(), "ws://127.0.0.1:8081/game");
        assert_eq!(registry.session_url(id), format!("ws://127.0.0.1:8081/game/{id}"));
    }
}
