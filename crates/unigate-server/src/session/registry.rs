//! Session registry: one logical session per user.
//!
//! Sessions are keyed by `UserIdentity` and each sits behind its own async
//! mutex, so operations on different users never wait on each other. A
//! secondary index maps live connection ids back to their user.
//!
//! Exclusivity: `acquire` holds the user's lock while it evicts the previous
//! connection and waits for that connection to acknowledge, so two
//! connection ids are never bound to one user at the same time.

use super::outbox::Outbox;
use super::state::ConnectionState;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use unigate_core::{ConnectionId, Envelope, UserIdentity};

/// Requests the registry sends to a connection's task.
#[derive(Debug)]
pub enum ControlRequest {
    /// A newer connection for the same user has arrived. The task must move
    /// to Disconnected, tell its client, and hand back anything it had not
    /// sent yet.
    Evict { ack: oneshot::Sender<Vec<Envelope>> },
}

/// The live half of a session: how to reach the bound connection's task.
#[derive(Debug)]
pub struct Binding {
    pub conn_id: ConnectionId,
    pub outbound: mpsc::Sender<Envelope>,
    pub control: mpsc::Sender<ControlRequest>,
}

/// Why a connection let go of its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// Transport dropped without a close; the client is expected back.
    Dropped,
    /// Clean close by the client.
    Closed,
    /// The connection hit a protocol fault.
    Fault,
}

/// Outcome of `acquire`.
#[derive(Debug)]
pub struct Acquired {
    /// The existing session was reused rather than started fresh.
    pub resumed: bool,
    pub reconnect_count: u32,
    /// Connection that was bound before and has been evicted.
    pub evicted: Option<ConnectionId>,
    /// Outbound messages queued while unbound, oldest first.
    pub replay: Vec<Envelope>,
}

/// Outcome of `deliver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the live connection.
    Sent,
    /// Stored in the outbox until the user reconnects.
    Queued,
    /// No resumable session for this user, or the live connection is too
    /// far behind to take more.
    Dropped,
}

/// Read-only view of a session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub user: UserIdentity,
    pub connection: Option<ConnectionId>,
    pub state: ConnectionState,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub reconnect_count: u32,
    pub queued: usize,
}

struct Session {
    user: UserIdentity,
    binding: Option<Binding>,
    state: ConnectionState,
    created_at: Instant,
    last_activity: Instant,
    reconnect_count: u32,
    /// Until when an unbound session may be resumed.
    resume_deadline: Option<Instant>,
    /// Bumped on every bind/unbind; stale idle timers compare against it.
    epoch: u64,
    outbox: Outbox,
    /// Set when the record has been taken out of the map.
    removed: bool,
}

impl Session {
    fn new(user: UserIdentity, outbox_capacity: usize) -> Self {
        let now = Instant::now();
        Self {
            user,
            binding: None,
            state: ConnectionState::Disconnected,
            created_at: now,
            last_activity: now,
            reconnect_count: 0,
            resume_deadline: None,
            epoch: 0,
            outbox: Outbox::new(outbox_capacity),
            removed: false,
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(user = %self.user, from = %self.state, to = %next, "illegal session transition");
            return;
        }
        debug!(user = %self.user, from = %self.state, to = %next, "session state");
        self.state = next;
    }

    fn resumable(&self, now: Instant) -> bool {
        self.resume_deadline.is_some_and(|deadline| now < deadline)
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            user: self.user.clone(),
            connection: self.binding.as_ref().map(|b| b.conn_id),
            state: self.state,
            created_at: self.created_at,
            last_activity: self.last_activity,
            reconnect_count: self.reconnect_count,
            queued: self.outbox.len(),
        }
    }
}

struct Inner {
    sessions: DashMap<UserIdentity, Arc<Mutex<Session>>>,
    connections: DashMap<ConnectionId, UserIdentity>,
    idle_timeout: Duration,
    outbox_capacity: usize,
    eviction_timeout: Duration,
}

/// Owns every session record.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration, outbox_capacity: usize, eviction_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                connections: DashMap::new(),
                idle_timeout,
                outbox_capacity,
                eviction_timeout,
            }),
        }
    }

    pub fn from_config(config: &crate::config::GatewayConfig) -> Self {
        Self::new(
            config.idle_timeout,
            config.outbox_capacity,
            config.eviction_timeout,
        )
    }

    pub fn idle_timeout(&self) -> Duration {
        self.inner.idle_timeout
    }

    /// Bind `binding` to `user`'s session, creating or resuming it.
    ///
    /// A connection already bound to the session is evicted first, and this
    /// call does not return until it has acknowledged (or the eviction
    /// timeout passed). The session ends up in `Connecting`; the caller
    /// moves it on with [`confirm`](Self::confirm).
    pub async fn acquire(&self, user: &UserIdentity, binding: Binding) -> Acquired {
        loop {
            let slot = self.slot(user);
            let mut session = slot.lock().await;
            if session.removed {
                // Swept between lookup and lock; start over with a fresh record.
                continue;
            }

            let now = Instant::now();
            let mut evicted = None;
            if let Some(old) = session.binding.take() {
                self.inner.connections.remove(&old.conn_id);
                evicted = Some(old.conn_id);
                info!(user = %user, old = %old.conn_id, new = %binding.conn_id, "evicting previous connection");
                let unsent = self.evict(old).await;
                session.outbox.requeue_front(unsent);
                session.set_state(ConnectionState::Disconnected);
            }

            let resumed = evicted.is_some() || session.resumable(now);
            if resumed {
                session.reconnect_count += 1;
            } else {
                if session.state != ConnectionState::Disconnected {
                    session.set_state(ConnectionState::Disconnected);
                }
                session.created_at = now;
                session.reconnect_count = 0;
                session.outbox.clear();
            }

            let conn_id = binding.conn_id;
            session.epoch += 1;
            session.resume_deadline = None;
            session.last_activity = now;
            session.binding = Some(binding);
            session.set_state(ConnectionState::Connecting);
            self.inner.connections.insert(conn_id, user.clone());

            let replay = session.outbox.drain();
            info!(
                user = %user,
                conn = %conn_id,
                resumed,
                reconnects = session.reconnect_count,
                replay = replay.len(),
                "session acquired"
            );

            return Acquired {
                resumed,
                reconnect_count: session.reconnect_count,
                evicted,
                replay,
            };
        }
    }

    /// Move the session bound to `conn_id` from Connecting to Connected.
    ///
    /// Returns false if the connection is no longer bound.
    pub async fn confirm(&self, conn_id: ConnectionId) -> bool {
        let Some(slot) = self.slot_for_connection(conn_id) else {
            return false;
        };
        let mut session = slot.lock().await;
        if !is_bound_to(&session, conn_id) {
            return false;
        }
        session.set_state(ConnectionState::Connected);
        session.last_activity = Instant::now();
        true
    }

    /// Unbind `conn_id` from its session, keeping the record for resume.
    ///
    /// `unsent` are outbound messages the connection took but never
    /// delivered; they are queued ahead of anything newer. Returns the
    /// session's new state, or `None` if the connection was not bound
    /// (already evicted or swept).
    pub async fn release(
        &self,
        conn_id: ConnectionId,
        reason: ReleaseReason,
        unsent: Vec<Envelope>,
    ) -> Option<ConnectionState> {
        let Some(slot) = self.slot_for_connection(conn_id) else {
            if !unsent.is_empty() {
                debug!(conn = %conn_id, count = unsent.len(), "release of unbound connection");
            }
            return None;
        };
        let mut session = slot.lock().await;
        if !is_bound_to(&session, conn_id) {
            if !unsent.is_empty() {
                debug!(conn = %conn_id, count = unsent.len(), "release of unbound connection");
            }
            return None;
        }

        session.binding = None;
        self.inner.connections.remove(&conn_id);
        session.outbox.requeue_front(unsent);

        let now = Instant::now();
        let deadline = now + self.inner.idle_timeout;
        session.epoch += 1;
        session.last_activity = now;
        session.resume_deadline = Some(deadline);

        if reason == ReleaseReason::Dropped && session.state == ConnectionState::Connected {
            session.set_state(ConnectionState::Reconnecting);
            self.spawn_idle_timer(session.user.clone(), session.epoch, deadline);
        } else {
            session.set_state(ConnectionState::Disconnected);
        }

        info!(user = %session.user, conn = %conn_id, reason = ?reason, state = %session.state, "session released");
        Some(session.state)
    }

    /// Send `envelope` to `user`, or queue it while they are away.
    ///
    /// A live connection buffers at most `outbox_capacity` messages; past
    /// that, new messages are dropped rather than queued without bound.
    pub async fn deliver(&self, user: &UserIdentity, envelope: Envelope) -> Delivery {
        let Some(slot) = self.existing(user) else {
            return Delivery::Dropped;
        };
        let mut session = slot.lock().await;
        if session.removed {
            return Delivery::Dropped;
        }

        let envelope = match &session.binding {
            Some(binding) => match binding.outbound.try_send(envelope) {
                Ok(()) => return Delivery::Sent,
                Err(TrySendError::Full(_)) => {
                    warn!(user = %user, conn = %binding.conn_id, "outbound queue full, message dropped");
                    return Delivery::Dropped;
                }
                // Task is gone but has not released yet.
                Err(TrySendError::Closed(envelope)) => envelope,
            },
            None if session.resumable(Instant::now()) => envelope,
            None => return Delivery::Dropped,
        };
        session.outbox.push(envelope);
        Delivery::Queued
    }

    /// Record activity on `user`'s session.
    ///
    /// Best effort: skipped while the session is locked, since the holder may
    /// be an `acquire` waiting on the caller's own connection to step down.
    pub fn touch(&self, user: &UserIdentity) {
        if let Some(slot) = self.existing(user) {
            if let Ok(mut session) = slot.try_lock() {
                session.last_activity = Instant::now();
            }
        }
    }

    pub async fn lookup_by_user(&self, user: &UserIdentity) -> Option<SessionInfo> {
        let slot = self.existing(user)?;
        let session = slot.lock().await;
        (!session.removed).then(|| session.info())
    }

    pub async fn lookup_by_connection(&self, conn_id: ConnectionId) -> Option<SessionInfo> {
        let slot = self.slot_for_connection(conn_id)?;
        let session = slot.lock().await;
        is_bound_to(&session, conn_id).then(|| session.info())
    }

    /// Destroy `user`'s session, evicting its connection if one is bound.
    pub async fn logout(&self, user: &UserIdentity) -> bool {
        let Some(slot) = self.existing(user) else {
            return false;
        };
        let mut session = slot.lock().await;
        if session.removed {
            return false;
        }
        if let Some(old) = session.binding.take() {
            self.inner.connections.remove(&old.conn_id);
            self.evict(old).await;
        }
        session.removed = true;
        self.inner
            .sessions
            .remove_if(user, |_, current| Arc::ptr_eq(current, &slot));
        info!(user = %user, "session logged out");
        true
    }

    /// Remove unbound sessions whose resume window has passed.
    ///
    /// Returns the users whose sessions were destroyed.
    pub async fn sweep(&self) -> Vec<UserIdentity> {
        let slots: Vec<Arc<Mutex<Session>>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let now = Instant::now();
        let mut removed = Vec::new();
        for slot in slots {
            let mut session = slot.lock().await;
            if session.removed || session.binding.is_some() || session.resumable(now) {
                continue;
            }
            session.set_state(ConnectionState::Disconnected);
            session.removed = true;
            self.inner
                .sessions
                .remove_if(&session.user, |_, current| Arc::ptr_eq(current, &slot));
            removed.push(session.user.clone());
        }

        if !removed.is_empty() {
            debug!(count = removed.len(), "sweep removed sessions");
        }
        removed
    }

    /// Number of session records (bound or resumable).
    pub fn count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Number of connections currently bound to a session.
    pub fn bound_connections(&self) -> usize {
        self.inner.connections.len()
    }

    fn slot(&self, user: &UserIdentity) -> Arc<Mutex<Session>> {
        let entry = self
            .inner
            .sessions
            .entry(user.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(user.clone(), self.inner.outbox_capacity))));
        Arc::clone(entry.value())
    }

    fn existing(&self, user: &UserIdentity) -> Option<Arc<Mutex<Session>>> {
        self.inner
            .sessions
            .get(user)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn slot_for_connection(&self, conn_id: ConnectionId) -> Option<Arc<Mutex<Session>>> {
        let user = self.inner.connections.get(&conn_id).map(|u| u.value().clone())?;
        self.existing(&user)
    }

    /// Ask a bound connection to step down and wait for it.
    async fn evict(&self, old: Binding) -> Vec<Envelope> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if old
            .control
            .try_send(ControlRequest::Evict { ack: ack_tx })
            .is_err()
        {
            debug!(conn = %old.conn_id, "evicted connection already gone");
            return Vec::new();
        }
        match tokio::time::timeout(self.inner.eviction_timeout, ack_rx).await {
            Ok(Ok(unsent)) => unsent,
            Ok(Err(_)) => Vec::new(),
            Err(_) => {
                warn!(conn = %old.conn_id, "evicted connection did not acknowledge in time");
                Vec::new()
            }
        }
    }

    /// Single countdown for a dropped session; a later bind bumps the epoch
    /// and makes this timer a no-op.
    fn spawn_idle_timer(&self, user: UserIdentity, epoch: u64, deadline: Instant) {
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            registry.expire(&user, epoch).await;
        });
    }

    async fn expire(&self, user: &UserIdentity, epoch: u64) {
        let Some(slot) = self.existing(user) else {
            return;
        };
        let mut session = slot.lock().await;
        if session.removed || session.epoch != epoch || session.binding.is_some() {
            return;
        }
        if session.state == ConnectionState::Reconnecting {
            session.set_state(ConnectionState::Disconnected);
            info!(user = %user, "resume window elapsed");
        }
    }
}

fn is_bound_to(session: &Session, conn_id: ConnectionId) -> bool {
    !session.removed
        && session
            .binding
            .as_ref()
            .is_some_and(|b| b.conn_id == conn_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const IDLE: Duration = Duration::from_secs(10);

    fn registry() -> SessionRegistry {
        SessionRegistry::new(IDLE, 16, Duration::from_secs(1))
    }

    struct Handle {
        binding: Option<Binding>,
        outbound: mpsc::Receiver<Envelope>,
        control: mpsc::Receiver<ControlRequest>,
        conn_id: ConnectionId,
    }

    fn handle() -> Handle {
        let (out_tx, out_rx) = mpsc::channel(4);
        let (ctl_tx, ctl_rx) = mpsc::channel(1);
        let conn_id = ConnectionId::next();
        Handle {
            binding: Some(Binding {
                conn_id,
                outbound: out_tx,
                control: ctl_tx,
            }),
            outbound: out_rx,
            control: ctl_rx,
            conn_id,
        }
    }

    fn user(name: &str) -> UserIdentity {
        UserIdentity::new(name)
    }

    #[tokio::test(start_paused = true)]
    async fn first_acquire_creates_connecting_session() {
        let reg = registry();
        let mut h = handle();
        let acquired = reg.acquire(&user("u1"), h.binding.take().unwrap()).await;
        assert!(!acquired.resumed);
        assert_eq!(acquired.evicted, None);

        let info = reg.lookup_by_user(&user("u1")).await.unwrap();
        assert_eq!(info.state, ConnectionState::Connecting);
        assert_eq!(info.connection, Some(h.conn_id));

        assert!(reg.confirm(h.conn_id).await);
        let info = reg.lookup_by_connection(h.conn_id).await.unwrap();
        assert_eq!(info.state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn second_acquire_evicts_first_synchronously() {
        let reg = registry();
        let mut first = handle();
        reg.acquire(&user("u1"), first.binding.take().unwrap()).await;
        reg.confirm(first.conn_id).await;

        // Pending delivery to the first connection that it never sends.
        assert_eq!(reg.deliver(&user("u1"), Envelope::new("NOTE", json!(1))).await, Delivery::Sent);

        let mut control = first.control;
        let mut outbound = first.outbound;
        let evictee = tokio::spawn(async move {
            let Some(ControlRequest::Evict { ack }) = control.recv().await else {
                panic!("expected eviction");
            };
            let mut unsent = Vec::new();
            while let Ok(env) = outbound.try_recv() {
                unsent.push(env);
            }
            ack.send(unsent).unwrap();
        });

        let mut second = handle();
        let acquired = reg.acquire(&user("u1"), second.binding.take().unwrap()).await;
        evictee.await.unwrap();

        assert_eq!(acquired.evicted, Some(first.conn_id));
        assert!(acquired.resumed);
        assert_eq!(acquired.replay.len(), 1);
        assert!(reg.lookup_by_connection(first.conn_id).await.is_none());
        assert_eq!(reg.bound_connections(), 1);

        // The evicted connection's release is a no-op.
        assert_eq!(reg.release(first.conn_id, ReleaseReason::Closed, Vec::new()).await, None);
        let info = reg.lookup_by_user(&user("u1")).await.unwrap();
        assert_eq!(info.connection, Some(second.conn_id));
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_of_dead_task_does_not_block() {
        let reg = registry();
        let mut first = handle();
        reg.acquire(&user("u1"), first.binding.take().unwrap()).await;
        drop(first.control);

        let mut second = handle();
        let acquired = reg.acquire(&user("u1"), second.binding.take().unwrap()).await;
        assert_eq!(acquired.evicted, Some(first.conn_id));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_session_resumes_within_idle_timeout() {
        let reg = registry();
        let mut first = handle();
        reg.acquire(&user("u1"), first.binding.take().unwrap()).await;
        reg.confirm(first.conn_id).await;

        let state = reg.release(first.conn_id, ReleaseReason::Dropped, Vec::new()).await;
        assert_eq!(state, Some(ConnectionState::Reconnecting));
        assert_eq!(reg.deliver(&user("u1"), Envelope::new("A", json!(1))).await, Delivery::Queued);
        assert_eq!(reg.deliver(&user("u1"), Envelope::new("B", json!(2))).await, Delivery::Queued);

        tokio::time::advance(Duration::from_secs(5)).await;

        let mut second = handle();
        let acquired = reg.acquire(&user("u1"), second.binding.take().unwrap()).await;
        assert!(acquired.resumed);
        assert_eq!(acquired.reconnect_count, 1);
        let kinds: Vec<_> = acquired.replay.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["A", "B"]);

        // The old timer fires after the original deadline but is stale.
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        reg.confirm(second.conn_id).await;
        let info = reg.lookup_by_user(&user("u1")).await.unwrap();
        assert_eq!(info.state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_moves_reconnecting_to_disconnected() {
        let reg = registry();
        let mut first = handle();
        reg.acquire(&user("u1"), first.binding.take().unwrap()).await;
        reg.confirm(first.conn_id).await;
        reg.release(first.conn_id, ReleaseReason::Dropped, Vec::new()).await;

        tokio::time::sleep(IDLE + Duration::from_millis(1)).await;
        let info = reg.lookup_by_user(&user("u1")).await.unwrap();
        assert_eq!(info.state, ConnectionState::Disconnected);

        assert_eq!(reg.deliver(&user("u1"), Envelope::new("LATE", json!(0))).await, Delivery::Dropped);
        assert_eq!(reg.sweep().await, vec![user("u1")]);
        assert!(reg.lookup_by_user(&user("u1")).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_after_timeout_starts_fresh() {
        let reg = registry();
        let mut first = handle();
        reg.acquire(&user("u1"), first.binding.take().unwrap()).await;
        reg.confirm(first.conn_id).await;
        reg.release(first.conn_id, ReleaseReason::Dropped, vec![Envelope::new("OLD", json!(0))])
            .await;

        tokio::time::sleep(IDLE * 2).await;

        let mut second = handle();
        let acquired = reg.acquire(&user("u1"), second.binding.take().unwrap()).await;
        assert!(!acquired.resumed);
        assert_eq!(acquired.reconnect_count, 0);
        assert!(acquired.replay.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn clean_close_disconnects_but_keeps_record() {
        let reg = registry();
        let mut first = handle();
        reg.acquire(&user("u1"), first.binding.take().unwrap()).await;
        reg.confirm(first.conn_id).await;

        let state = reg.release(first.conn_id, ReleaseReason::Closed, Vec::new()).await;
        assert_eq!(state, Some(ConnectionState::Disconnected));
        assert!(reg.sweep().await.is_empty());
        assert_eq!(reg.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn users_are_independent() {
        let reg = registry();
        let mut a = handle();
        let mut b = handle();
        reg.acquire(&user("a"), a.binding.take().unwrap()).await;
        let acquired = reg.acquire(&user("b"), b.binding.take().unwrap()).await;
        assert_eq!(acquired.evicted, None);
        assert_eq!(reg.bound_connections(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_destroys_session() {
        let reg = registry();
        let mut first = handle();
        reg.acquire(&user("u1"), first.binding.take().unwrap()).await;
        drop(first.control);

        assert!(reg.logout(&user("u1")).await);
        assert!(reg.lookup_by_user(&user("u1")).await.is_none());
        assert!(reg.lookup_by_connection(first.conn_id).await.is_none());
        assert!(!reg.logout(&user("u1")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn deliver_to_backed_up_connection_is_dropped() {
        let reg = registry();
        let mut h = handle();
        reg.acquire(&user("u1"), h.binding.take().unwrap()).await;
        reg.confirm(h.conn_id).await;

        for n in 0..4 {
            assert_eq!(reg.deliver(&user("u1"), Envelope::new("N", json!(n))).await, Delivery::Sent);
        }
        assert_eq!(reg.deliver(&user("u1"), Envelope::new("N", json!(4))).await, Delivery::Dropped);

        // Draining makes room again; nothing was diverted to the outbox.
        assert_eq!(h.outbound.recv().await.unwrap().data, json!(0));
        assert_eq!(reg.deliver(&user("u1"), Envelope::new("N", json!(5))).await, Delivery::Sent);
        assert_eq!(reg.lookup_by_user(&user("u1")).await.unwrap().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deliver_to_unknown_user_is_dropped() {
        let reg = registry();
        assert_eq!(reg.deliver(&user("nobody"), Envelope::new("X", json!(null))).await, Delivery::Dropped);
    }
}
