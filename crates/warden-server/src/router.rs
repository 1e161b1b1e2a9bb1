//! Connection registry and per-socket read/write loops.
//!
//! All connections live in one map behind one mutex. Delivery never blocks:
//! a connection whose queue is full or closed is evicted and delivery moves
//! on to the rest. Removal from the map is the only path that fires the
//! disconnect handler, so it runs exactly once per connection whichever side
//! noticed the failure first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use warden_core::ids::{ConnectionId, SessionId};
use warden_telemetry::MetricsRecorder;

/// Handles a raw inbound frame. `binding` lets the handler attach the
/// connection to a session.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, raw: String, binding: SessionBinding);
}

/// Called once after a connection has been removed.
pub trait DisconnectHandler: Send + Sync {
    fn on_disconnect(&self, conn: ConnectionId, session_id: Option<SessionId>);
}

struct Connection {
    session_id: Option<SessionId>,
    tx: mpsc::Sender<String>,
    last_seen: Instant,
    /// Session frames are held back while a replay is streamed to it.
    replaying: bool,
}

struct RouterInner {
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    send_queue: usize,
    on_message: RwLock<Option<Arc<dyn MessageHandler>>>,
    on_disconnect: RwLock<Option<Arc<dyn DisconnectHandler>>>,
    metrics: Option<Arc<MetricsRecorder>>,
}

#[derive(Clone)]
pub struct ConnectionRouter {
    inner: Arc<RouterInner>,
}

/// A connection's view of its own session mapping.
#[derive(Clone)]
pub struct SessionBinding {
    router: ConnectionRouter,
    conn: ConnectionId,
}

impl SessionBinding {
    pub fn connection_id(&self) -> &ConnectionId {
        &self.conn
    }

    pub fn current(&self) -> Option<SessionId> {
        self.router.session_of(&self.conn)
    }

    pub fn set(&self, session_id: SessionId) -> bool {
        self.router.set_session(&self.conn, session_id)
    }

    /// Send directly to this connection.
    pub fn reply(&self, frame: String) -> bool {
        self.router.send_to(&self.conn, frame)
    }
}

impl ConnectionRouter {
    pub fn new(send_queue: usize) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                connections: Mutex::new(HashMap::new()),
                send_queue: send_queue.max(1),
                on_message: RwLock::new(None),
                on_disconnect: RwLock::new(None),
                metrics: None,
            }),
        }
    }

    pub fn with_metrics(send_queue: usize, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                connections: Mutex::new(HashMap::new()),
                send_queue: send_queue.max(1),
                on_message: RwLock::new(None),
                on_disconnect: RwLock::new(None),
                metrics: Some(metrics),
            }),
        }
    }

    pub fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.inner.on_message.write() = Some(handler);
    }

    pub fn set_disconnect_handler(&self, handler: Arc<dyn DisconnectHandler>) {
        *self.inner.on_disconnect.write() = Some(handler);
    }

    pub fn register(&self, session_id: Option<SessionId>) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.inner.send_queue);
        let count = {
            let mut conns = self.inner.connections.lock();
            conns.insert(
                id.clone(),
                Connection {
                    session_id,
                    tx,
                    last_seen: Instant::now(),
                    replaying: false,
                },
            );
            conns.len()
        };
        self.record_count(count);
        (id, rx)
    }

    pub fn binding(&self, conn: &ConnectionId) -> SessionBinding {
        SessionBinding {
            router: self.clone(),
            conn: conn.clone(),
        }
    }

    pub fn set_session(&self, conn: &ConnectionId, session_id: SessionId) -> bool {
        match self.inner.connections.lock().get_mut(conn) {
            Some(c) => {
                debug!(conn = %conn, session_id = %session_id, "connection bound to session");
                c.session_id = Some(session_id);
                true
            }
            None => false,
        }
    }

    /// Bind the connection and stop live session delivery to it until
    /// [`finish_replay`](Self::finish_replay). Returns the connection's
    /// sender, or `None` if it is gone or already replaying.
    pub fn begin_replay(
        &self,
        conn: &ConnectionId,
        session_id: SessionId,
    ) -> Option<mpsc::Sender<String>> {
        let mut conns = self.inner.connections.lock();
        let c = conns.get_mut(conn)?;
        if c.replaying {
            return None;
        }
        debug!(conn = %conn, session_id = %session_id, "replay started");
        c.session_id = Some(session_id);
        c.replaying = true;
        Some(c.tx.clone())
    }

    pub fn finish_replay(&self, conn: &ConnectionId) -> bool {
        match self.inner.connections.lock().get_mut(conn) {
            Some(c) => {
                c.replaying = false;
                true
            }
            None => false,
        }
    }

    pub fn session_of(&self, conn: &ConnectionId) -> Option<SessionId> {
        self.inner
            .connections
            .lock()
            .get(conn)
            .and_then(|c| c.session_id.clone())
    }

    pub fn has_session(&self, session_id: &SessionId) -> bool {
        self.inner
            .connections
            .lock()
            .values()
            .any(|c| c.session_id.as_ref() == Some(session_id))
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    pub fn send_to(&self, conn: &ConnectionId, frame: String) -> bool {
        let delivered = {
            let conns = self.inner.connections.lock();
            match conns.get(conn) {
                Some(c) => c.tx.try_send(frame).is_ok(),
                None => return false,
            }
        };
        if !delivered {
            self.remove(conn, "send failed");
        }
        delivered
    }

    /// Deliver to every connection mapped to `session_id`, skipping those
    /// mid-replay. Returns the number of connections that accepted the frame.
    pub fn send_to_session(&self, session_id: &SessionId, frame: &str) -> usize {
        self.deliver(
            |c| !c.replaying && c.session_id.as_ref() == Some(session_id),
            frame,
        )
    }

    pub fn broadcast(&self, frame: &str) -> usize {
        self.deliver(|_| true, frame)
    }

    fn deliver(&self, matches: impl Fn(&Connection) -> bool, frame: &str) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let conns = self.inner.connections.lock();
            for (id, c) in conns.iter().filter(|(_, c)| matches(c)) {
                match c.tx.try_send(frame.to_string()) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        let reason = match e {
                            mpsc::error::TrySendError::Full(_) => "send queue full",
                            mpsc::error::TrySendError::Closed(_) => "connection closed",
                        };
                        failed.push((id.clone(), reason));
                    }
                }
            }
        }
        for (id, reason) in failed {
            self.remove(&id, reason);
        }
        delivered
    }

    pub fn record_pong(&self, conn: &ConnectionId) {
        if let Some(c) = self.inner.connections.lock().get_mut(conn) {
            c.last_seen = Instant::now();
        }
    }

    /// Drop the connection and run the disconnect handler. Returns false if
    /// it was already gone.
    pub fn remove(&self, conn: &ConnectionId, reason: &str) -> bool {
        let (removed, count) = {
            let mut conns = self.inner.connections.lock();
            let removed = conns.remove(conn);
            (removed, conns.len())
        };
        let Some(removed) = removed else {
            return false;
        };

        info!(conn = %conn, session_id = ?removed.session_id, reason, "connection removed");
        self.record_count(count);
        if let Some(m) = &self.inner.metrics {
            m.increment_counter("router_evictions_total", &[("reason", reason)], 1);
        }

        let handler = self.inner.on_disconnect.read().clone();
        match handler {
            Some(h) => h.on_disconnect(conn.clone(), removed.session_id),
            None => debug!(conn = %conn, "no disconnect handler registered"),
        }
        true
    }

    /// Evict connections silent for longer than `timeout`.
    pub fn evict_stale(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<ConnectionId> = self
            .inner
            .connections
            .lock()
            .iter()
            .filter(|(_, c)| now.duration_since(c.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        stale
            .iter()
            .filter(|id| self.remove(id, "heartbeat timeout"))
            .count()
    }

    pub async fn dispatch(&self, conn: &ConnectionId, raw: String) {
        let handler = self.inner.on_message.read().clone();
        match handler {
            Some(h) => h.handle(raw, self.binding(conn)).await,
            None => warn!(conn = %conn, "no message handler registered, dropping frame"),
        }
    }

    /// Drive one socket until either side closes, then remove the connection.
    pub async fn serve_socket(
        &self,
        socket: WebSocket,
        conn: ConnectionId,
        mut rx: mpsc::Receiver<String>,
        heartbeat: Duration,
    ) {
        let (mut ws_tx, mut ws_rx) = socket.split();

        let writer_conn = conn.clone();
        let mut writer = tokio::spawn(async move {
            let mut ping = tokio::time::interval(heartbeat);
            ping.tick().await;
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = ping.tick() => {
                        if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                        trace!(conn = %writer_conn, "sent ping");
                    }
                }
            }
            let _ = ws_tx.close().await;
        });

        let router = self.clone();
        let reader_conn = conn.clone();
        let mut reader = tokio::spawn(async move {
            while let Some(Ok(msg)) = ws_rx.next().await {
                match msg {
                    WsMessage::Text(text) => {
                        router.record_pong(&reader_conn);
                        router.dispatch(&reader_conn, text.as_str().to_owned()).await;
                    }
                    WsMessage::Pong(_) => router.record_pong(&reader_conn),
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        });

        tokio::select! {
            _ = &mut writer => reader.abort(),
            _ = &mut reader => writer.abort(),
        }
        self.remove(&conn, "socket closed");
    }

    /// Periodically evict silent connections until `cancel` fires.
    pub fn spawn_cleanup(
        &self,
        interval: Duration,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = router.evict_stale(timeout);
                        if removed > 0 {
                            info!(removed, "evicted silent connections");
                        }
                    }
                }
            }
        })
    }

    fn record_count(&self, count: usize) {
        if let Some(m) = &self.inner.metrics {
            m.set_gauge("router_connections", &[], count as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDisconnect {
        calls: AtomicUsize,
        last: Mutex<Option<(ConnectionId, Option<SessionId>)>>,
    }

    impl DisconnectHandler for CountingDisconnect {
        fn on_disconnect(&self, conn: ConnectionId, session_id: Option<SessionId>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some((conn, session_id));
        }
    }

    struct Rebinder;

    #[async_trait]
    impl MessageHandler for Rebinder {
        async fn handle(&self, raw: String, binding: SessionBinding) {
            binding.set(SessionId::from_raw(raw));
        }
    }

    #[test]
    fn send_to_session_only_reaches_mapped_connections() {
        let router = ConnectionRouter::new(8);
        let s = SessionId::new();
        let (_a, mut rx_a) = router.register(Some(s.clone()));
        let (_b, mut rx_b) = router.register(Some(s.clone()));
        let (_c, mut rx_c) = router.register(Some(SessionId::new()));

        assert_eq!(router.send_to_session(&s, "hello"), 2);
        assert_eq!(rx_a.try_recv().unwrap(), "hello");
        assert_eq!(rx_b.try_recv().unwrap(), "hello");
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn send_to_unmapped_session_delivers_nothing() {
        let router = ConnectionRouter::new(8);
        let _conn = router.register(None);
        assert_eq!(router.send_to_session(&SessionId::from_raw("X"), "msg"), 0);
    }

    #[test]
    fn full_connection_is_evicted_and_others_still_receive() {
        let router = ConnectionRouter::new(1);
        let disconnects = Arc::new(CountingDisconnect::default());
        router.set_disconnect_handler(disconnects.clone());

        let s = SessionId::new();
        let (slow, _slow_rx) = router.register(Some(s.clone()));
        let (_fast, mut fast_rx) = router.register(Some(s.clone()));

        assert_eq!(router.send_to_session(&s, "one"), 2);
        fast_rx.try_recv().unwrap();
        assert_eq!(router.send_to_session(&s, "two"), 1);

        assert_eq!(fast_rx.try_recv().unwrap(), "two");
        assert_eq!(router.connection_count(), 1);
        assert_eq!(disconnects.calls.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.last.lock().clone().unwrap(), (slow, Some(s)));
    }

    #[test]
    fn closed_connection_is_evicted_on_broadcast() {
        let router = ConnectionRouter::new(4);
        let (_gone, rx) = router.register(None);
        let (_live, mut live_rx) = router.register(None);
        drop(rx);

        assert_eq!(router.broadcast("all"), 1);
        assert_eq!(live_rx.try_recv().unwrap(), "all");
        assert_eq!(router.connection_count(), 1);
    }

    #[test]
    fn disconnect_handler_runs_exactly_once() {
        let router = ConnectionRouter::new(4);
        let disconnects = Arc::new(CountingDisconnect::default());
        router.set_disconnect_handler(disconnects.clone());

        let (conn, _rx) = router.register(None);
        assert!(router.remove(&conn, "socket closed"));
        assert!(!router.remove(&conn, "socket closed"));
        assert!(!router.send_to(&conn, "late".into()));
        assert_eq!(disconnects.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removal_without_handlers_is_harmless() {
        let router = ConnectionRouter::new(4);
        let (conn, _rx) = router.register(None);
        assert!(router.remove(&conn, "socket closed"));
        assert_eq!(router.connection_count(), 0);
    }

    #[tokio::test]
    async fn handler_can_rebind_session() {
        let router = ConnectionRouter::new(4);
        router.set_message_handler(Arc::new(Rebinder));
        let (conn, _rx) = router.register(None);

        router.dispatch(&conn, "sess_late".into()).await;
        assert_eq!(router.session_of(&conn), Some(SessionId::from_raw("sess_late")));
        assert!(router.has_session(&SessionId::from_raw("sess_late")));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connections_are_evicted() {
        let router = ConnectionRouter::new(4);
        let (quiet, _q) = router.register(None);
        let (chatty, _c) = router.register(None);

        tokio::time::advance(Duration::from_secs(60)).await;
        router.record_pong(&chatty);
        tokio::time::advance(Duration::from_secs(40)).await;

        assert_eq!(router.evict_stale(Duration::from_secs(90)), 1);
        assert_eq!(router.connection_count(), 1);
        assert!(!router.send_to(&quiet, "{}".into()));
        assert!(router.send_to(&chatty, "{}".into()));
    }

    #[test]
    fn replaying_connection_is_skipped_until_finished() {
        let router = ConnectionRouter::new(8);
        let s = SessionId::new();
        let (conn, mut rx) = router.register(None);

        assert!(router.begin_replay(&conn, s.clone()).is_some());
        assert!(router.begin_replay(&conn, s.clone()).is_none());
        assert!(router.has_session(&s));
        assert_eq!(router.send_to_session(&s, "held"), 0);
        assert!(rx.try_recv().is_err());

        assert!(router.finish_replay(&conn));
        assert_eq!(router.send_to_session(&s, "live"), 1);
        assert_eq!(rx.try_recv().unwrap(), "live");
    }

    #[test]
    fn connection_gauge_tracks_registrations() {
        let metrics = Arc::new(MetricsRecorder::new());
        let router = ConnectionRouter::with_metrics(4, Arc::clone(&metrics));
        let (a, _ra) = router.register(None);
        let _b = router.register(None);
        assert_eq!(metrics.gauge("router_connections", &[]), 2.0);
        router.remove(&a, "socket closed");
        assert_eq!(metrics.gauge("router_connections", &[]), 1.0);
        assert_eq!(
            metrics.counter("router_evictions_total", &[("reason", "socket closed")]),
            1
        );
    }
}
