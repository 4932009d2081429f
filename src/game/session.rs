/// A running duel between two connected players.
///
/// Both players' connection drivers and the turn timer funnel into the same
/// lock. Every message caused by a state change is queued while that lock is
/// held, so both players always hear about events in the order they happened.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::protocol::{EndReason, Outcome, ServerMessage};
use crate::game::duel::{Duel, Finish, GuessResult, Rejection, PLAYERS};
use crate::game::SessionId;

/// Instructions for a connection's writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Close,
}

/// Sending half of a player's outbound queue
#[derive(Debug, Clone)]
pub struct PlayerLink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl PlayerLink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the connection is gone
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(Outbound::Message(message)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// Handed to a connection once its session exists
pub struct Seat {
    pub session: Arc<GameSession>,
    pub index: usize,
}

/// A connection waiting to be seated
pub struct Entrant {
    pub link: PlayerLink,
    pub seat: oneshot::Sender<Seat>,
}

impl Entrant {
    pub fn new(link: PlayerLink) -> (Self, oneshot::Receiver<Seat>) {
        let (seat, seat_rx) = oneshot::channel();
        (Self { link, seat }, seat_rx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub id: SessionId,
    pub winner: usize,
    pub reason: EndReason,
    pub target: u32,
    pub turns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub range: (u32, u32),
    pub current: usize,
    pub turn: u64,
    pub finish: Option<Finish>,
    pub deadline: Option<Instant>,
}

pub struct GameSession {
    id: SessionId,
    turn_timeout: Duration,
    state: Mutex<SessionState>,
}

struct SessionState {
    duel: Duel,
    players: [PlayerLink; PLAYERS],
    timer: Option<JoinHandle<()>>,
    deadline: Option<Instant>,
    report: Option<oneshot::Sender<SessionReport>>,
}

impl GameSession {
    /// Seat both entrants, announce the start and arm the first turn timer.
    /// An entrant that vanished before being seated forfeits immediately.
    pub async fn launch(
        id: SessionId,
        duel: Duel,
        entrants: [Entrant; PLAYERS],
        turn_timeout: Duration,
        report: oneshot::Sender<SessionReport>,
    ) -> Arc<Self> {
        let [first, second] = entrants;
        let session = Arc::new(Self {
            id,
            turn_timeout,
            state: Mutex::new(SessionState {
                duel,
                players: [first.link, second.link],
                timer: None,
                deadline: None,
                report: Some(report),
            }),
        });

        let mut state = session.state.lock().await;

        let mut absent = None;
        for (index, seat) in [first.seat, second.seat].into_iter().enumerate() {
            let handed = seat.send(Seat {
                session: Arc::clone(&session),
                index,
            });
            if handed.is_err() {
                absent = Some(index);
            }
        }

        let (min, max) = state.duel.range();
        let hints = state.duel.hints();
        let current = state.duel.current();
        info!(session = %id, target = state.duel.target(), first = current, "Game started");
        for (index, player) in state.players.iter().enumerate() {
            let your_turn = index == current;
            player.send(ServerMessage::Start {
                message: format!("Game started! {}", turn_phrase(your_turn)),
                your_turn,
                min,
                max,
                hints,
            });
        }

        match absent {
            Some(index) => {
                info!(session = %id, player = index, "Player left before the game started");
                if let Some(finish) = state.duel.disconnect(index) {
                    session.conclude(&mut state, finish);
                }
            }
            None => session.arm_timer(&mut state),
        }

        drop(state);
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        SessionSnapshot {
            range: state.duel.range(),
            current: state.duel.current(),
            turn: state.duel.turn(),
            finish: state.duel.finish(),
            deadline: state.deadline,
        }
    }

    pub async fn submit_guess(self: &Arc<Self>, player: usize, value: i64) {
        let mut state = self.state.lock().await;

        match state.duel.guess(player, value) {
            GuessResult::Rejected(Rejection::Finished) => {
                debug!(session = %self.id, player, "Guess after the game ended ignored");
            }
            GuessResult::Rejected(rejection) => {
                debug!(session = %self.id, player, value, ?rejection, "Guess rejected");
                if let Some(link) = state.players.get(player) {
                    link.send(ServerMessage::error(rejection.message()));
                }
            }
            GuessResult::Won(finish) => {
                info!(session = %self.id, player, value, "Number guessed");
                self.conclude(&mut state, finish);
            }
            GuessResult::Narrowed { min, max, current } => {
                cancel_timer(&mut state);
                debug!(session = %self.id, player, value, min, max, "Range narrowed");

                let hints = state.duel.hints();
                for (index, link) in state.players.iter().enumerate() {
                    let your_turn = index == current;
                    link.send(ServerMessage::Update {
                        message: format!("Valid range: {min}-{max}. {}", turn_phrase(your_turn)),
                        your_turn,
                        min,
                        max,
                        hints,
                    });
                }
                self.arm_timer(&mut state);
            }
        }
    }

    /// Called by a connection driver when its socket ends
    pub async fn handle_disconnect(&self, player: usize) {
        let mut state = self.state.lock().await;

        match state.duel.disconnect(player) {
            Some(finish) => {
                info!(session = %self.id, player, "Player disconnected");
                self.conclude(&mut state, finish);
            }
            None => {
                for link in &state.players {
                    link.close();
                }
            }
        }
    }

    async fn expire_turn(&self, turn: u64) {
        let mut state = self.state.lock().await;

        match state.duel.expire_turn(turn) {
            Some(finish) => {
                // This is the timer task itself; don't abort it from under us.
                state.timer.take();
                info!(session = %self.id, player = finish.loser(), "Turn timed out");
                self.conclude(&mut state, finish);
            }
            None => debug!(session = %self.id, turn, "Stale turn timer ignored"),
        }
    }

    fn arm_timer(self: &Arc<Self>, state: &mut SessionState) {
        cancel_timer(state);

        let turn = state.duel.turn();
        let deadline = Instant::now() + self.turn_timeout;
        let session = Arc::clone(self);
        state.deadline = Some(deadline);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            session.expire_turn(turn).await;
        }));
    }

    fn conclude(&self, state: &mut SessionState, finish: Finish) {
        cancel_timer(state);

        let target = state.duel.target();
        for (index, link) in state.players.iter().enumerate() {
            let outcome = if index == finish.winner { Outcome::Win } else { Outcome::Lose };
            link.send(ServerMessage::End {
                message: end_message(finish.reason, outcome, target),
                outcome,
                reason: finish.reason,
                target: Some(target),
            });
            link.close();
        }

        info!(session = %self.id, winner = finish.winner, reason = ?finish.reason, "Game over");
        if let Some(report) = state.report.take() {
            let _ = report.send(SessionReport {
                id: self.id,
                winner: finish.winner,
                reason: finish.reason,
                target,
                turns: state.duel.turn(),
            });
        }
    }
}

fn cancel_timer(state: &mut SessionState) {
    if let Some(timer) = state.timer.take() {
        timer.abort();
    }
    state.deadline = None;
}

fn turn_phrase(your_turn: bool) -> &'static str {
    if your_turn {
        "It's your turn"
    } else {
        "Opponent's turn"
    }
}

fn end_message(reason: EndReason, outcome: Outcome, target: u32) -> String {
    let verdict = match outcome {
        Outcome::Win => "You win!",
        Outcome::Lose => "You lose!",
    };
    match (reason, outcome) {
        (EndReason::Guessed, _) => format!("Game over! Number was: {target}. {verdict}"),
        (EndReason::Timeout, Outcome::Win) => {
            format!("Game over! Your opponent took too long to make a guess. {verdict}")
        }
        (EndReason::Timeout, Outcome::Lose) => {
            format!("Game over! You took too long to make a guess. {verdict}")
        }
        (EndReason::Disconnect, Outcome::Win) => format!("Opponent disconnected. {verdict}"),
        (EndReason::Disconnect, Outcome::Lose) => format!("You disconnected. {verdict}"),
        (EndReason::Forfeit, _) => format!("Game over! {verdict}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::HintView;

    struct Harness {
        session: Arc<GameSession>,
        outbound: [mpsc::UnboundedReceiver<Outbound>; 2],
        report: oneshot::Receiver<SessionReport>,
    }

    const TURN: Duration = Duration::from_secs(30);

    fn hints() -> HintView {
        HintView {
            is_even: Some(true),
            digit_sum: Some(6),
            is_prime: None,
        }
    }

    async fn launch_42(first: usize) -> Harness {
        let (link_a, rx_a) = PlayerLink::channel();
        let (link_b, rx_b) = PlayerLink::channel();
        let (entrant_a, seat_a) = Entrant::new(link_a);
        let (entrant_b, seat_b) = Entrant::new(link_b);
        let (report_tx, report) = oneshot::channel();

        let session = GameSession::launch(
            SessionId::new(),
            Duel::with_target(42, first, hints()),
            [entrant_a, entrant_b],
            TURN,
            report_tx,
        )
        .await;

        assert_eq!(seat_a.await.unwrap().index, 0);
        assert_eq!(seat_b.await.unwrap().index, 1);

        Harness {
            session,
            outbound: [rx_a, rx_b],
            report,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn end_of(items: &[Outbound]) -> (Outcome, EndReason) {
        match items {
            [Outbound::Message(ServerMessage::End { outcome, reason, .. }), Outbound::Close] => {
                (*outcome, *reason)
            }
            other => panic!("expected end followed by close, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_tells_each_player_whose_turn_it_is() {
        let mut h = launch_42(1).await;

        for (index, rx) in h.outbound.iter_mut().enumerate() {
            match drain(rx).as_slice() {
                [Outbound::Message(ServerMessage::Start { your_turn, min, max, hints: shown, .. })] => {
                    assert_eq!(*your_turn, index == 1);
                    assert_eq!((*min, *max), (1, 100));
                    assert_eq!(*shown, hints());
                }
                other => panic!("unexpected start frames {other:?}"),
            }
        }

        let snapshot = h.session.snapshot().await;
        assert_eq!(snapshot.current, 1);
        assert!(snapshot.deadline.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_target_42() {
        let mut h = launch_42(0).await;
        drain(&mut h.outbound[0]);
        drain(&mut h.outbound[1]);

        h.session.submit_guess(0, 50).await;
        for (index, rx) in h.outbound.iter_mut().enumerate() {
            match drain(rx).as_slice() {
                [Outbound::Message(ServerMessage::Update { min, max, your_turn, hints: shown, .. })] => {
                    assert_eq!((*min, *max), (1, 49));
                    assert_eq!(*your_turn, index == 1);
                    assert_eq!(*shown, hints());
                }
                other => panic!("unexpected update {other:?}"),
            }
        }

        h.session.submit_guess(1, 25).await;
        assert_eq!(h.session.snapshot().await.range, (26, 49));
        drain(&mut h.outbound[0]);
        drain(&mut h.outbound[1]);

        h.session.submit_guess(0, 42).await;
        assert_eq!(end_of(&drain(&mut h.outbound[0])), (Outcome::Win, EndReason::Guessed));
        assert_eq!(end_of(&drain(&mut h.outbound[1])), (Outcome::Lose, EndReason::Guessed));

        let report = h.report.await.unwrap();
        assert_eq!(report.winner, 0);
        assert_eq!(report.target, 42);
        assert_eq!(report.turns, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn violations_are_reported_only_to_the_offender() {
        let mut h = launch_42(0).await;
        drain(&mut h.outbound[0]);
        drain(&mut h.outbound[1]);

        h.session.submit_guess(1, 10).await;
        assert_eq!(
            drain(&mut h.outbound[1]),
            vec![Outbound::Message(ServerMessage::error("Not your turn"))]
        );
        assert!(drain(&mut h.outbound[0]).is_empty());

        h.session.submit_guess(0, 101).await;
        assert_eq!(
            drain(&mut h.outbound[0]),
            vec![Outbound::Message(ServerMessage::error("Number out of valid range (1-100)"))]
        );
        assert!(drain(&mut h.outbound[1]).is_empty());

        let snapshot = h.session.snapshot().await;
        assert_eq!(snapshot.current, 0);
        assert_eq!(snapshot.turn, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalling_player_loses_on_timeout() {
        let mut h = launch_42(0).await;
        drain(&mut h.outbound[0]);
        drain(&mut h.outbound[1]);

        tokio::time::sleep(TURN + Duration::from_secs(1)).await;

        assert_eq!(end_of(&drain(&mut h.outbound[0])), (Outcome::Lose, EndReason::Timeout));
        assert_eq!(end_of(&drain(&mut h.outbound[1])), (Outcome::Win, EndReason::Timeout));
        let report = h.report.await.unwrap();
        assert_eq!(report.winner, 1);
        assert_eq!(report.reason, EndReason::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn valid_guess_rearms_the_timer() {
        let mut h = launch_42(0).await;

        tokio::time::sleep(Duration::from_secs(20)).await;
        h.session.submit_guess(0, 50).await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(h.session.snapshot().await.finish.is_none());

        tokio::time::sleep(Duration::from_secs(11)).await;
        let finish = h.session.snapshot().await.finish.unwrap();
        assert_eq!(finish.winner, 0);
        assert_eq!(finish.reason, EndReason::Timeout);
        drain(&mut h.outbound[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_guess_does_not_buy_time() {
        let h = launch_42(0).await;

        tokio::time::sleep(Duration::from_secs(20)).await;
        h.session.submit_guess(0, 0).await;
        tokio::time::sleep(Duration::from_secs(11)).await;

        let finish = h.session.snapshot().await.finish.unwrap();
        assert_eq!(finish.winner, 1);
        assert_eq!(finish.reason, EndReason::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_turn_timer_is_silent() {
        let mut h = launch_42(0).await;
        h.session.submit_guess(0, 42).await;
        drain(&mut h.outbound[0]);
        drain(&mut h.outbound[1]);

        tokio::time::sleep(TURN * 3).await;
        assert!(drain(&mut h.outbound[0]).is_empty());
        assert!(drain(&mut h.outbound[1]).is_empty());

        let finish = h.session.snapshot().await.finish.unwrap();
        assert_eq!(finish.reason, EndReason::Guessed);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_hands_the_win_to_the_survivor() {
        let mut h = launch_42(0).await;
        drain(&mut h.outbound[0]);
        drain(&mut h.outbound[1]);

        h.session.handle_disconnect(0).await;
        assert_eq!(end_of(&drain(&mut h.outbound[1])), (Outcome::Win, EndReason::Disconnect));
        drain(&mut h.outbound[0]);

        // The survivor's driver reports its own socket closing afterwards
        h.session.handle_disconnect(1).await;
        assert_eq!(drain(&mut h.outbound[1]), vec![Outbound::Close]);

        let report = h.report.await.unwrap();
        assert_eq!(report.winner, 1);
        assert_eq!(report.reason, EndReason::Disconnect);

        tokio::time::sleep(TURN * 2).await;
        assert!(drain(&mut h.outbound[1]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn entrant_gone_before_seating_forfeits() {
        let (link_a, mut rx_a) = PlayerLink::channel();
        let (link_b, _rx_b) = PlayerLink::channel();
        let (entrant_a, _seat_a) = Entrant::new(link_a);
        let (entrant_b, seat_b) = Entrant::new(link_b);
        drop(seat_b);
        let (report_tx, report) = oneshot::channel();

        GameSession::launch(
            SessionId::new(),
            Duel::with_target(7, 0, hints()),
            [entrant_a, entrant_b],
            TURN,
            report_tx,
        )
        .await;

        let frames = drain(&mut rx_a);
        assert!(matches!(frames[0], Outbound::Message(ServerMessage::Start { .. })));
        assert_eq!(end_of(&frames[1..]), (Outcome::Win, EndReason::Disconnect));
        assert_eq!(report.await.unwrap().winner, 0);
    }
}
