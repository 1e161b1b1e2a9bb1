//! Synchronous approval broker for tool calls.
//!
//! [`PermissionGate::request_approval`] runs inside a task's execution slot
//! and suspends until a human decides. Requests from one session are
//! serialized by a per-session async mutex that is held for the whole wait,
//! so a session never has more than one outstanding prompt and prompts are
//! resolved in arrival order. Sessions never contend with each other.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use warden_core::ids::{PermissionId, SessionId};
use warden_core::permission::{
    CreatePermissionRequest, GrantScope, PermissionNotification, PermissionRequest,
};
use warden_core::{Broker, Event, EventKind};
use warden_telemetry::MetricsRecorder;

use crate::error::PermissionError;

#[derive(Clone, Debug, Default)]
pub struct GateConfig {
    /// Approve everything without prompting (unattended runs).
    pub skip_all: bool,
    /// Entries of the form `tool`, `tool:action` or `tool:action:/dir`.
    pub allow_list: Vec<String>,
    /// Scope for requests with an empty or relative path.
    pub working_dir: PathBuf,
    /// Give up waiting after this long. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
}

struct PendingSlot {
    request: PermissionRequest,
    respond: oneshot::Sender<bool>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct DecisionKey {
    session_id: SessionId,
    tool: String,
    action: String,
    path: String,
}

impl DecisionKey {
    fn of(req: &PermissionRequest) -> Self {
        Self {
            session_id: req.session_id.clone(),
            tool: req.tool_name.clone(),
            action: req.action.clone(),
            path: req.path.clone(),
        }
    }
}

pub struct PermissionGate {
    config: GateConfig,
    allow_list: HashSet<String>,
    auto_approve: DashSet<SessionId>,
    session_allow: DashMap<SessionId, HashSet<String>>,
    decisions: Mutex<HashSet<DecisionKey>>,
    session_locks: DashMap<SessionId, Arc<tokio::sync::Mutex<()>>>,
    pending: DashMap<PermissionId, PendingSlot>,
    active: DashMap<SessionId, PermissionRequest>,
    requests: Broker<PermissionRequest>,
    notifications: Broker<PermissionNotification>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl PermissionGate {
    pub fn new(config: GateConfig) -> Self {
        let allow_list = config.allow_list.iter().cloned().collect();
        Self {
            config,
            allow_list,
            auto_approve: DashSet::new(),
            session_allow: DashMap::new(),
            decisions: Mutex::new(HashSet::new()),
            session_locks: DashMap::new(),
            pending: DashMap::new(),
            active: DashMap::new(),
            requests: Broker::default(),
            notifications: Broker::default(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn subscribe_requests(&self) -> broadcast::Receiver<Event<PermissionRequest>> {
        self.requests.subscribe()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Event<PermissionNotification>> {
        self.notifications.subscribe()
    }

    /// Block until the request is granted or denied.
    ///
    /// Returns `Err(Cancelled)` when `cancel` fires or the session is
    /// abandoned, and `Err(Timeout)` when the configured timeout elapses.
    pub async fn request_approval(
        &self,
        req: CreatePermissionRequest,
        cancel: &CancellationToken,
    ) -> Result<bool, PermissionError> {
        if self.config.skip_all {
            self.count("skipped");
            return Ok(true);
        }

        let lock = Arc::clone(
            self.session_locks
                .entry(req.session_id.clone())
                .or_default()
                .value(),
        );
        let _held = tokio::select! {
            guard = lock.lock_owned() => guard,
            () = cancel.cancelled() => {
                self.count("cancelled");
                return Err(PermissionError::Cancelled);
            }
        };

        if self.allowed_by_name(&req) {
            self.count("allow_list");
            return Ok(true);
        }
        if self.auto_approve.contains(&req.session_id) {
            self.count("auto_approve");
            return Ok(true);
        }

        let scope = resolve_scope(&self.config.working_dir, &req.path).await;
        let scope = scope.to_string_lossy().into_owned();
        let exact = format!("{}:{}:{}", req.tool_name, req.action, scope);
        if self.allow_list.contains(&exact) {
            self.count("allow_list");
            return Ok(true);
        }

        let request = PermissionRequest::from_create(req, scope);
        if self.decisions.lock().contains(&DecisionKey::of(&request)) {
            self.count("cached");
            return Ok(true);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request.id.clone(),
            PendingSlot {
                request: request.clone(),
                respond: tx,
            },
        );
        self.active.insert(request.session_id.clone(), request.clone());
        let _slot = SlotGuard {
            gate: self,
            id: request.id.clone(),
            session_id: request.session_id.clone(),
        };

        info!(
            session_id = %request.session_id,
            tool_call_id = %request.tool_call_id,
            permission_id = %request.id,
            tool = %request.tool_name,
            action = %request.action,
            "awaiting permission"
        );
        let started = Instant::now();
        self.requests.publish(EventKind::Created, request);

        let outcome = match self.config.request_timeout {
            Some(limit) => tokio::select! {
                decision = rx => decision.map_err(|_| PermissionError::Cancelled),
                () = cancel.cancelled() => Err(PermissionError::Cancelled),
                () = tokio::time::sleep(limit) => Err(PermissionError::Timeout(limit)),
            },
            None => tokio::select! {
                decision = rx => decision.map_err(|_| PermissionError::Cancelled),
                () = cancel.cancelled() => Err(PermissionError::Cancelled),
            },
        };

        if let Some(m) = &self.metrics {
            m.observe("permission_wait_ms", &[], started.elapsed().as_secs_f64() * 1000.0);
        }
        self.count(match &outcome {
            Ok(true) => "granted",
            Ok(false) => "denied",
            Err(PermissionError::Cancelled) => "cancelled",
            Err(PermissionError::Timeout(_)) => "timeout",
        });
        outcome
    }

    pub fn grant(&self, id: &PermissionId) -> bool {
        self.resolve(id, true, GrantScope::Once)
    }

    /// Grant and remember the (tool, action, directory) tuple for the session.
    pub fn grant_persistent(&self, id: &PermissionId) -> bool {
        self.resolve(id, true, GrantScope::Persistent)
    }

    /// Grant and allow the tool/action pair anywhere in the session.
    pub fn grant_for_session(&self, id: &PermissionId) -> bool {
        self.resolve(id, true, GrantScope::Session)
    }

    pub fn deny(&self, id: &PermissionId) -> bool {
        self.resolve(id, false, GrantScope::Once)
    }

    /// Dispatch a client decision. Returns false when nobody is waiting on `id`.
    pub fn respond(&self, id: &PermissionId, granted: bool, scope: GrantScope) -> bool {
        self.resolve(id, granted, scope)
    }

    pub fn auto_approve_session(&self, session_id: &SessionId) {
        info!(session_id = %session_id, "auto-approving session");
        self.auto_approve.insert(session_id.clone());
    }

    pub fn is_auto_approved(&self, session_id: &SessionId) -> bool {
        self.auto_approve.contains(session_id)
    }

    /// The request a session is currently blocked on, if any.
    pub fn active_request(&self, session_id: &SessionId) -> Option<PermissionRequest> {
        self.active.get(session_id).map(|r| r.value().clone())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop every response slot of the session. Waiters observe `Cancelled`.
    pub fn abandon_session(&self, session_id: &SessionId) -> usize {
        let ids: Vec<PermissionId> = self
            .pending
            .iter()
            .filter(|e| &e.value().request.session_id == session_id)
            .map(|e| e.key().clone())
            .collect();
        let mut dropped = 0;
        for id in ids {
            if self.pending.remove(&id).is_some() {
                dropped += 1;
            }
        }
        self.active.remove(session_id);
        if dropped > 0 {
            debug!(session_id = %session_id, dropped, "abandoned pending permission requests");
        }
        dropped
    }

    /// Abandon pending requests and discard every per-session decision.
    pub fn forget_session(&self, session_id: &SessionId) {
        self.abandon_session(session_id);
        self.auto_approve.remove(session_id);
        self.session_allow.remove(session_id);
        self.decisions.lock().retain(|k| &k.session_id != session_id);
        self.session_locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn allowed_by_name(&self, req: &CreatePermissionRequest) -> bool {
        let pair = format!("{}:{}", req.tool_name, req.action);
        if self.allow_list.contains(&pair) || self.allow_list.contains(&req.tool_name) {
            return true;
        }
        self.session_allow
            .get(&req.session_id)
            .is_some_and(|set| set.contains(&pair))
    }

    fn resolve(&self, id: &PermissionId, granted: bool, scope: GrantScope) -> bool {
        let Some((_, slot)) = self.pending.remove(id) else {
            debug!(permission_id = %id, "no waiter for permission decision");
            return false;
        };
        let request = slot.request;

        if granted {
            match scope {
                GrantScope::Once => {}
                GrantScope::Persistent => {
                    self.decisions.lock().insert(DecisionKey::of(&request));
                }
                GrantScope::Session => {
                    self.session_allow
                        .entry(request.session_id.clone())
                        .or_default()
                        .insert(format!("{}:{}", request.tool_name, request.action));
                }
            }
        }

        // The waiter may have timed out between the removal and now.
        let _ = slot.respond.send(granted);
        self.active
            .remove_if(&request.session_id, |_, active| active.id == request.id);

        self.notifications.publish(
            EventKind::Created,
            PermissionNotification {
                id: request.id,
                session_id: request.session_id,
                tool_call_id: request.tool_call_id,
                granted,
                denied: !granted,
                scope: granted.then_some(scope),
            },
        );
        true
    }

    fn count(&self, outcome: &str) {
        if let Some(m) = &self.metrics {
            m.increment_counter("permission_requests_total", &[("outcome", outcome)], 1);
        }
    }
}

/// Removes the response slot and the active marker however the wait ends.
struct SlotGuard<'a> {
    gate: &'a PermissionGate,
    id: PermissionId,
    session_id: SessionId,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.gate.pending.remove(&self.id);
        self.gate
            .active
            .remove_if(&self.session_id, |_, active| active.id == self.id);
    }
}

/// Directory an approval applies to: the path itself when it is a
/// directory, otherwise its parent. Empty and relative paths resolve
/// against `working_dir`.
pub async fn resolve_scope(working_dir: &Path, raw: &str) -> PathBuf {
    if raw.is_empty() {
        return working_dir.to_path_buf();
    }
    let path = normalize(&working_dir.join(raw));
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_dir() => path,
        _ => path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| working_dir.to_path_buf()),
    }
}

/// Fold `.` and `..` lexically. `..` at the root stays at the root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::ids::ToolCallId;

    fn gate(config: GateConfig) -> Arc<PermissionGate> {
        Arc::new(PermissionGate::new(GateConfig {
            working_dir: PathBuf::from("/work"),
            ..config
        }))
    }

    fn create(session: &SessionId, tool: &str, action: &str, path: &str) -> CreatePermissionRequest {
        CreatePermissionRequest {
            session_id: session.clone(),
            tool_call_id: ToolCallId::new(),
            tool_name: tool.into(),
            action: action.into(),
            path: path.into(),
            description: format!("{tool} {action} {path}"),
            params: serde_json::Value::Null,
        }
    }

    fn spawn_request(
        gate: &Arc<PermissionGate>,
        req: CreatePermissionRequest,
    ) -> tokio::task::JoinHandle<Result<bool, PermissionError>> {
        let gate = Arc::clone(gate);
        tokio::spawn(async move { gate.request_approval(req, &CancellationToken::new()).await })
    }

    async fn next_request(
        rx: &mut broadcast::Receiver<Event<PermissionRequest>>,
    ) -> PermissionRequest {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("request published")
            .unwrap()
            .payload
    }

    #[tokio::test]
    async fn skip_all_grants_without_prompting() {
        let gate = gate(GateConfig {
            skip_all: true,
            ..Default::default()
        });
        let mut rx = gate.subscribe_requests();
        let ok = gate
            .request_approval(create(&SessionId::new(), "bash", "execute", ""), &CancellationToken::new())
            .await
            .unwrap();
        assert!(ok);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn allow_list_matches_pair_and_bare_tool() {
        let gate = gate(GateConfig {
            allow_list: vec!["read:read".into(), "ls".into()],
            ..Default::default()
        });
        let session = SessionId::new();
        let token = CancellationToken::new();
        assert!(gate.request_approval(create(&session, "read", "read", "a.rs"), &token).await.unwrap());
        assert!(gate.request_approval(create(&session, "ls", "list", ""), &token).await.unwrap());
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn allow_list_matches_exact_directory() {
        let gate = gate(GateConfig {
            allow_list: vec!["write:write:/work/src".into()],
            ..Default::default()
        });
        let token = CancellationToken::new();
        let ok = gate
            .request_approval(create(&SessionId::new(), "write", "write", "src/lib.rs"), &token)
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn auto_approved_session_skips_prompt() {
        let gate = gate(GateConfig::default());
        let session = SessionId::new();
        gate.auto_approve_session(&session);
        assert!(gate.is_auto_approved(&session));
        let ok = gate
            .request_approval(create(&session, "bash", "execute", ""), &CancellationToken::new())
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn grant_resolves_waiter_and_notifies() {
        let gate = gate(GateConfig::default());
        let mut requests = gate.subscribe_requests();
        let mut notes = gate.subscribe_notifications();
        let session = SessionId::new();

        let waiter = spawn_request(&gate, create(&session, "bash", "execute", ""));
        let req = next_request(&mut requests).await;
        assert_eq!(req.path, "/work");
        assert_eq!(gate.active_request(&session).map(|r| r.id), Some(req.id.clone()));

        assert!(gate.grant(&req.id));
        assert!(waiter.await.unwrap().unwrap());

        let note = notes.recv().await.unwrap().payload;
        assert!(note.granted && !note.denied);
        assert_eq!(note.tool_call_id, req.tool_call_id);
        assert!(gate.active_request(&session).is_none());
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn deny_returns_false() {
        let gate = gate(GateConfig::default());
        let mut requests = gate.subscribe_requests();
        let waiter = spawn_request(&gate, create(&SessionId::new(), "bash", "execute", ""));
        let req = next_request(&mut requests).await;
        assert!(gate.deny(&req.id));
        assert!(!waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn unknown_id_is_a_silent_noop() {
        let gate = gate(GateConfig::default());
        let mut notes = gate.subscribe_notifications();
        let id = PermissionId::new();
        assert!(!gate.grant(&id));
        assert!(!gate.grant_persistent(&id));
        assert!(!gate.deny(&id));
        assert!(notes.try_recv().is_err());
    }

    #[tokio::test]
    async fn persistent_grant_covers_same_directory_only() {
        let gate = gate(GateConfig::default());
        let mut requests = gate.subscribe_requests();
        let session = SessionId::new();

        let first = spawn_request(&gate, create(&session, "write", "write", "src/a.rs"));
        let req = next_request(&mut requests).await;
        assert!(gate.grant_persistent(&req.id));
        assert!(first.await.unwrap().unwrap());

        // Same tool, action and directory: no prompt.
        let again = gate
            .request_approval(create(&session, "write", "write", "src/b.rs"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(again);
        assert!(requests.try_recv().is_err());

        // Other directory, other session: prompt again.
        let other_dir = spawn_request(&gate, create(&session, "write", "write", "docs/x.md"));
        let req = next_request(&mut requests).await;
        assert_eq!(req.path, "/work/docs");
        gate.deny(&req.id);
        assert!(!other_dir.await.unwrap().unwrap());

        let other_session = spawn_request(&gate, create(&SessionId::new(), "write", "write", "src/a.rs"));
        let req = next_request(&mut requests).await;
        gate.grant(&req.id);
        assert!(other_session.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn session_grant_covers_tool_action_anywhere() {
        let gate = gate(GateConfig::default());
        let mut requests = gate.subscribe_requests();
        let session = SessionId::new();

        let first = spawn_request(&gate, create(&session, "bash", "execute", "a"));
        let req = next_request(&mut requests).await;
        assert!(gate.grant_for_session(&req.id));
        first.await.unwrap().unwrap();

        let token = CancellationToken::new();
        assert!(gate.request_approval(create(&session, "bash", "execute", "/elsewhere"), &token).await.unwrap());
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn same_session_requests_are_serialized() {
        let gate = gate(GateConfig::default());
        let mut requests = gate.subscribe_requests();
        let session = SessionId::new();

        let a = spawn_request(&gate, create(&session, "bash", "execute", ""));
        let first = next_request(&mut requests).await;
        let b = spawn_request(&gate, create(&session, "write", "write", "x"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(requests.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
        assert_eq!(gate.pending_count(), 1);

        gate.grant(&first.id);
        assert!(a.await.unwrap().unwrap());

        let second = next_request(&mut requests).await;
        assert_eq!(second.tool_name, "write");
        gate.deny(&second.id);
        assert!(!b.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn different_sessions_prompt_concurrently() {
        let gate = gate(GateConfig::default());
        let mut requests = gate.subscribe_requests();
        let a = spawn_request(&gate, create(&SessionId::new(), "bash", "execute", ""));
        let b = spawn_request(&gate, create(&SessionId::new(), "bash", "execute", ""));

        let r1 = next_request(&mut requests).await;
        let r2 = next_request(&mut requests).await;
        assert_ne!(r1.session_id, r2.session_id);
        gate.grant(&r1.id);
        gate.grant(&r2.id);
        assert!(a.await.unwrap().unwrap());
        assert!(b.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn cancellation_is_distinct_from_deny() {
        let gate = gate(GateConfig::default());
        let mut requests = gate.subscribe_requests();
        let session = SessionId::new();
        let token = CancellationToken::new();

        let waiter = {
            let gate = Arc::clone(&gate);
            let token = token.clone();
            let req = create(&session, "bash", "execute", "");
            tokio::spawn(async move { gate.request_approval(req, &token).await })
        };
        let req = next_request(&mut requests).await;
        token.cancel();

        assert_eq!(waiter.await.unwrap(), Err(PermissionError::Cancelled));
        assert_eq!(gate.pending_count(), 0);
        assert!(gate.active_request(&session).is_none());
        assert!(!gate.grant(&req.id));
    }

    #[tokio::test]
    async fn abandoned_session_releases_waiters() {
        let gate = gate(GateConfig::default());
        let mut requests = gate.subscribe_requests();
        let session = SessionId::new();
        let waiter = spawn_request(&gate, create(&session, "bash", "execute", ""));
        next_request(&mut requests).await;

        assert_eq!(gate.abandon_session(&session), 1);
        assert_eq!(waiter.await.unwrap(), Err(PermissionError::Cancelled));
        assert!(gate.active_request(&session).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out() {
        let gate = gate(GateConfig {
            request_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let result = gate
            .request_approval(create(&SessionId::new(), "bash", "execute", ""), &CancellationToken::new())
            .await;
        assert_eq!(result, Err(PermissionError::Timeout(Duration::from_secs(30))));
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn forget_session_drops_cached_decisions() {
        let gate = gate(GateConfig::default());
        let mut requests = gate.subscribe_requests();
        let session = SessionId::new();
        gate.auto_approve_session(&session);
        gate.forget_session(&session);
        assert!(!gate.is_auto_approved(&session));

        let waiter = spawn_request(&gate, create(&session, "bash", "execute", ""));
        let req = next_request(&mut requests).await;
        gate.grant(&req.id);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn metrics_count_outcomes() {
        let metrics = Arc::new(MetricsRecorder::new());
        let gate = Arc::new(
            PermissionGate::new(GateConfig {
                allow_list: vec!["ls".into()],
                ..Default::default()
            })
            .with_metrics(Arc::clone(&metrics)),
        );
        gate.request_approval(create(&SessionId::new(), "ls", "list", ""), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            metrics.counter("permission_requests_total", &[("outcome", "allow_list")]),
            1
        );
    }

    #[tokio::test]
    async fn scope_resolution() {
        let dir = std::env::temp_dir().join(format!("warden-scope-{}", SessionId::new()));
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("sub/file.txt"), "x").unwrap();

        assert_eq!(resolve_scope(&dir, "").await, dir);
        assert_eq!(resolve_scope(&dir, "sub").await, dir.join("sub"));
        assert_eq!(resolve_scope(&dir, "sub/file.txt").await, dir.join("sub"));
        assert_eq!(resolve_scope(&dir, "./sub/missing.rs").await, dir.join("sub"));
        assert_eq!(resolve_scope(&dir, ".").await, dir);
        assert_eq!(resolve_scope(&dir, "/etc/hosts").await, PathBuf::from("/etc"));
        assert_eq!(resolve_scope(&dir, "sub/../sub/file.txt").await, dir.join("sub"));
        assert_eq!(resolve_scope(&dir, "sub/..").await, dir);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn parent_segments_cannot_hide_the_real_scope() {
        let work = Path::new("/warden-scope-missing/work");
        assert_eq!(
            resolve_scope(work, "../etc/x").await,
            PathBuf::from("/warden-scope-missing/etc")
        );
        assert_eq!(
            resolve_scope(work, "a/b/../../../../../../etc/passwd").await,
            PathBuf::from("/etc")
        );
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize(Path::new("/..")), PathBuf::from("/"));
    }

    #[tokio::test]
    async fn approval_for_a_parent_escape_covers_the_folded_directory() {
        let gate = gate(GateConfig::default());
        let session = SessionId::new();
        let mut rx = gate.subscribe_requests();

        let pending = spawn_request(&gate, create(&session, "write", "write", "../outside/f.txt"));
        let req = next_request(&mut rx).await;
        assert_eq!(req.path, "/outside");
        assert!(gate.grant_persistent(&req.id));
        assert_eq!(pending.await.unwrap(), Ok(true));

        // A later request for the literal directory is already covered, while
        // the working directory itself is not.
        let covered = create(&session, "write", "write", "/outside/g.txt");
        assert_eq!(
            gate.request_approval(covered, &CancellationToken::new()).await,
            Ok(true)
        );
        let again = spawn_request(&gate, create(&session, "write", "write", "x.txt"));
        let prompt = next_request(&mut rx).await;
        assert_eq!(prompt.path, "/work");
        assert!(gate.deny(&prompt.id));
        assert_eq!(again.await.unwrap(), Ok(false));
    }
}
