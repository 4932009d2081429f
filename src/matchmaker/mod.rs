/// Capacity-one rendezvous: the first request waits on a ticket, the second
/// provisions a session and hands its location to both.
pub mod provision;
pub mod server;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::config::MatchmakerConfig;
use crate::core::error::ProvisionError;
use crate::core::protocol::MatchResponse;

pub use provision::{HttpAllocator, LocalEngine, SessionLocation, SessionProvisioner, StaticLocation};
pub use server::MatchmakerServer;

type Fulfilment = Result<SessionLocation, ProvisionError>;

/// How a match request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched(SessionLocation),
    TimedOut,
    Failed(ProvisionError),
    /// Another pairing is still being provisioned
    Busy,
}

impl MatchOutcome {
    pub fn into_response(self) -> MatchResponse {
        match self {
            MatchOutcome::Matched(location) => MatchResponse::matched(location.into_string()),
            MatchOutcome::TimedOut => MatchResponse::timeout(),
            MatchOutcome::Failed(_) => MatchResponse::error("Failed to create game session"),
            MatchOutcome::Busy => MatchResponse::error("Matchmaker is busy"),
        }
    }
}

/// What `request_match` hands back to the caller
pub enum Admission {
    /// No one was waiting; this request now holds the ticket
    Waiting(WaitingTicket),
    /// This request consumed the outstanding ticket
    Paired(MatchOutcome),
    Rejected(MatchOutcome),
}

enum TicketSlot {
    Idle,
    Waiting {
        id: u64,
        notify: oneshot::Sender<Fulfilment>,
    },
    /// A ticket was consumed and its session is being provisioned
    Pairing,
}

pub struct Matchmaker {
    slot: Mutex<TicketSlot>,
    provisioner: Arc<dyn SessionProvisioner>,
    match_timeout: Duration,
    next_ticket: AtomicU64,
}

impl Matchmaker {
    pub fn new(provisioner: Arc<dyn SessionProvisioner>, config: &MatchmakerConfig) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(TicketSlot::Idle),
            provisioner,
            match_timeout: config.match_timeout,
            next_ticket: AtomicU64::new(1),
        })
    }

    pub fn match_timeout(&self) -> Duration {
        self.match_timeout
    }

    /// True while a request is parked on the ticket
    pub fn has_waiting(&self) -> bool {
        matches!(*self.slot.lock(), TicketSlot::Waiting { .. })
    }

    pub async fn request_match(self: &Arc<Self>) -> Admission {
        let (ticket, notify) = {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, TicketSlot::Pairing) {
                TicketSlot::Idle => {
                    let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                    let (notify, rx) = oneshot::channel();
                    *slot = TicketSlot::Waiting { id, notify };
                    debug!(ticket = id, "Player waiting for an opponent");
                    return Admission::Waiting(WaitingTicket {
                        id,
                        rx,
                        deadline: Instant::now() + self.match_timeout,
                        matchmaker: Arc::clone(self),
                    });
                }
                TicketSlot::Pairing => {
                    warn!("Rejecting match request while a pairing is in progress");
                    return Admission::Rejected(MatchOutcome::Busy);
                }
                TicketSlot::Waiting { id, notify } => (id, notify),
            }
        };

        info!(ticket, "Opponent found, provisioning a session");
        let result = {
            let _pairing = PairingGuard(self);
            self.provisioner.provision().await
        };

        match &result {
            Ok(location) => info!(ticket, %location, "Match made"),
            Err(e) => warn!(ticket, "Failed to create game session: {}", e),
        }
        if notify.send(result.clone()).is_err() {
            debug!(ticket, "Waiting player left before the match was made");
        }

        Admission::Paired(match result {
            Ok(location) => MatchOutcome::Matched(location),
            Err(e) => MatchOutcome::Failed(e),
        })
    }

    /// Remove ticket `id` if it is still the one waiting
    fn clear_ticket(&self, id: u64) -> bool {
        let mut slot = self.slot.lock();
        match *slot {
            TicketSlot::Waiting { id: waiting, .. } if waiting == id => {
                *slot = TicketSlot::Idle;
                true
            }
            _ => false,
        }
    }
}

/// Frees the slot once provisioning finishes, or if the pairing request is dropped mid-way
struct PairingGuard<'a>(&'a Matchmaker);

impl Drop for PairingGuard<'_> {
    fn drop(&mut self) {
        *self.0.slot.lock() = TicketSlot::Idle;
    }
}

/// The waiting side of a match. Dropping it while still outstanding frees the slot.
pub struct WaitingTicket {
    id: u64,
    rx: oneshot::Receiver<Fulfilment>,
    deadline: Instant,
    matchmaker: Arc<Matchmaker>,
}

impl WaitingTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn wait(mut self) -> MatchOutcome {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(result) => settle(result),
            Err(_) => {
                if self.matchmaker.clear_ticket(self.id) {
                    info!(ticket = self.id, "No opponent found in time");
                    return MatchOutcome::TimedOut;
                }
                // Already consumed by a pairing; its result wins over the clock
                debug!(ticket = self.id, "Deadline passed during pairing");
                settle((&mut self.rx).await)
            }
        }
    }
}

impl Drop for WaitingTicket {
    fn drop(&mut self) {
        if self.matchmaker.clear_ticket(self.id) {
            debug!(ticket = self.id, "Waiting player left");
        }
    }
}

fn settle(result: Result<Fulfilment, oneshot::error::RecvError>) -> MatchOutcome {
    match result {
        Ok(Ok(location)) => MatchOutcome::Matched(location),
        Ok(Err(e)) => MatchOutcome::Failed(e),
        Err(_) => MatchOutcome::Failed(ProvisionError::Unavailable(
            "pairing was abandoned".to_string(),
        )),
    }
}
