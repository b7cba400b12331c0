//! Pairing broker
//!
//! Tracks every half-connection in the process, pairs newcomers against the
//! two FIFO pending queues, and delivers the partner through a one-shot
//! continuation. A single mutex protects the queues, the id counter and the
//! id index; it is never held across I/O.

use crate::half::{HalfInfo, Role, Status};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::debug;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker is closed")]
    Closed,

    #[error("unknown half-connection id {0}")]
    UnknownHalf(u64),

    #[error("half-connection {0} is already paired")]
    AlreadyPaired(u64),
}

/// Everything one side needs from its partner once paired: the partner's
/// id, the route blob to forward (written before any spliced byte), and the
/// receiving end of the partner's inbox.
pub struct PeerLink {
    pub id: u64,
    pub route: Option<Bytes>,
    pub inbox: mpsc::Receiver<Bytes>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("route", &self.route)
            .finish()
    }
}

impl PartialEq for PeerLink {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.route == other.route
    }
}

/// Outcome of `admit`: either an immediate partner, or a continuation that
/// resolves to the partner — or to `None` when the half is abandoned.
pub enum Admission {
    Paired(PeerLink),
    Wait(oneshot::Receiver<Option<PeerLink>>),
}

/// Hooks observed by the keep-dialing pool on the satellites. The relay
/// installs no observer.
pub trait BrokerObserver: Send + Sync {
    fn on_connected(&self, half: &HalfInfo, peer: &HalfInfo) {
        let _ = (half, peer);
    }

    fn on_conn_closed(&self, half: &HalfInfo) {
        let _ = half;
    }
}

struct Waiting {
    id: u64,
    group_id: u8,
    match_token: Option<Bytes>,
    link: PeerLink,
    waiter: oneshot::Sender<Option<PeerLink>>,
}

struct HalfEntry {
    role: Role,
    group_id: u8,
    status: Status,
}

struct State {
    next_id: u64,
    closed: bool,
    pending_up: Vec<Waiting>,
    pending_down: Vec<Waiting>,
    halves: HashMap<u64, HalfEntry>,
}

impl State {
    fn queue_mut(&mut self, role: Role) -> &mut Vec<Waiting> {
        match role {
            Role::Down => &mut self.pending_down,
            _ => &mut self.pending_up,
        }
    }
}

pub struct Broker {
    state: Mutex<State>,
    observer: Mutex<Option<Arc<dyn BrokerObserver>>>,
    shutdown_tx: watch::Sender<bool>,
    drained: Notify,
}

impl Broker {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(State {
                next_id: 1,
                closed: false,
                pending_up: Vec::new(),
                pending_down: Vec::new(),
                halves: HashMap::new(),
            }),
            observer: Mutex::new(None),
            shutdown_tx,
            drained: Notify::new(),
        }
    }

    /// Install the observer. Called once at startup, before any traffic.
    pub fn set_observer(&self, observer: Arc<dyn BrokerObserver>) {
        *self.observer.lock().unwrap() = Some(observer);
    }

    /// A receiver that resolves when the broker shuts down.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Index a new half-connection and hand out its id.
    ///
    /// Registration happens as soon as the socket exists, before the
    /// handshake, so that a drop at any later point fires `on_conn_closed`
    /// exactly once with the status the half had.
    pub fn register(&self, role: Role, group_id: u8) -> Result<u64, BrokerError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(BrokerError::Closed);
        }

        let id = state.next_id;
        state.next_id += 1;
        state.halves.insert(
            id,
            HalfEntry {
                role,
                group_id,
                status: Status::Pending,
            },
        );
        Ok(id)
    }

    /// Attempt to pair `id` against the opposite pending queue, or park it.
    ///
    /// The scan is strictly FIFO: a newcomer without a match token takes the
    /// oldest same-group waiter; a newcomer with a token skips entries until
    /// it finds a byte-equal token.
    pub fn admit(
        &self,
        id: u64,
        role: Role,
        group_id: u8,
        match_token: Option<Bytes>,
        link: PeerLink,
    ) -> Result<Admission, BrokerError> {
        let (waiting, link, half_info, peer_info) = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(BrokerError::Closed);
            }

            {
                let entry = state
                    .halves
                    .get_mut(&id)
                    .ok_or(BrokerError::UnknownHalf(id))?;
                if entry.status != Status::Pending {
                    return Err(BrokerError::AlreadyPaired(id));
                }
                entry.role = role;
                entry.group_id = group_id;
            }

            let found = state.queue_mut(role.opposite()).iter().position(|w| {
                w.group_id == group_id
                    && match &match_token {
                        None => true,
                        Some(token) => w.match_token.as_deref() == Some(token.as_ref()),
                    }
            });

            match found {
                Some(index) => {
                    let waiting = state.queue_mut(role.opposite()).remove(index);
                    state.halves.get_mut(&id).unwrap().status = Status::Connected;
                    state.halves.get_mut(&waiting.id).unwrap().status = Status::Connected;

                    let half_info = HalfInfo {
                        id,
                        role,
                        group_id,
                        status: Status::Connected,
                    };
                    let peer_info = HalfInfo {
                        id: waiting.id,
                        role: role.opposite(),
                        group_id,
                        status: Status::Connected,
                    };
                    (waiting, link, half_info, peer_info)
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    state.queue_mut(role).push(Waiting {
                        id,
                        group_id,
                        match_token,
                        link,
                        waiter: tx,
                    });
                    return Ok(Admission::Wait(rx));
                }
            }
        };

        // Lock released: deliver the continuation and fire the hook. Both
        // halves are already marked connected, so a concurrent close cannot
        // observe them as pending.
        debug!(
            "connection paired: {} ({}) <-> {} ({})",
            half_info.id, half_info.role, peer_info.id, peer_info.role
        );

        let _ = waiting.waiter.send(Some(link));
        if let Some(observer) = self.observer.lock().unwrap().clone() {
            observer.on_connected(&half_info, &peer_info);
        }

        Ok(Admission::Paired(waiting.link))
    }

    /// Tear down a half-connection. Idempotent: the second and later calls
    /// are no-ops. If the half was still pending in a queue, its waiter
    /// receives `None` (abandoned) exactly once.
    pub fn remove(&self, id: u64) {
        let (info, waiter) = {
            let mut state = self.state.lock().unwrap();
            let Some(entry) = state.halves.remove(&id) else {
                return;
            };

            let mut waiter = None;
            if entry.status == Status::Pending {
                let state = &mut *state;
                for queue in [&mut state.pending_up, &mut state.pending_down] {
                    if let Some(index) = queue.iter().position(|w| w.id == id) {
                        waiter = Some(queue.remove(index).waiter);
                        break;
                    }
                }
            }

            if state.halves.is_empty() {
                self.drained.notify_waiters();
            }

            (
                HalfInfo {
                    id,
                    role: entry.role,
                    group_id: entry.group_id,
                    status: entry.status,
                },
                waiter,
            )
        };

        debug!("connection removed: {} ({} {})", id, info.role, info.status);

        if let Some(waiter) = waiter {
            let _ = waiter.send(None);
        }
        if let Some(observer) = self.observer.lock().unwrap().clone() {
            observer.on_conn_closed(&info);
        }
    }

    /// Begin shutdown: refuse new halves, abandon every pending waiter and
    /// broadcast the shutdown signal. Live connection drivers observe the
    /// broadcast and tear themselves down; `drain` waits for them.
    pub fn close(&self) {
        let waiters = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;

            let mut waiters = Vec::new();
            let state = &mut *state;
            for queue in [&mut state.pending_up, &mut state.pending_down] {
                for waiting in queue.drain(..) {
                    waiters.push(waiting.waiter);
                }
            }
            waiters
        };

        debug!("broker closing, {} pending waiters abandoned", waiters.len());

        for waiter in waiters {
            let _ = waiter.send(None);
        }
        // send_replace updates the value even when nobody subscribed yet.
        self.shutdown_tx.send_replace(true);
    }

    /// Resolve once every registered half has been removed. Only meaningful
    /// after `close`; callers bound it with a timeout.
    pub async fn drain(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a removal that lands in
            // between still wakes us.
            notified.as_mut().enable();
            if self.state.lock().unwrap().halves.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Number of halves currently waiting in the given role's queue.
    pub fn pending_len(&self, role: Role) -> usize {
        let state = self.state.lock().unwrap();
        match role {
            Role::Down => state.pending_down.len(),
            _ => state.pending_up.len(),
        }
    }

    /// Number of registered (pending or connected) halves.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().halves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}
