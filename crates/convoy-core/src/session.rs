// Canonical Session Facade
// One uniform surface over the registered backend adapters: session CRUD,
// single-flight turn gating with cancel-previous semantics, filtered event
// streams, and bounded retry on prompt submission.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use convoy_providers::{BackendAdapter, ProviderError};
use convoy_types::{AgentEvent, ContextUsage, SessionConfig, ToolRegistration};
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ConvoyError, Result};
use crate::hub::EventHub;

const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(300);

/// Bounded backoff schedule applied to prompt submission.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following the given 1-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Identity of one in-flight turn.
///
/// A token only ever affects the generation it was minted for: interrupting
/// or finishing with a stale token is a no-op. This is what makes
/// cancel-previous safe when turn resolutions race.
#[derive(Debug, Clone)]
pub struct TurnToken {
    session_id: String,
    generation: u64,
    interrupted: CancellationToken,
    deadline: Instant,
}

impl TurnToken {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Instant after which the caller should treat the turn as timed out.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Resolves when this turn is superseded, interrupted, or its session
    /// destroyed.
    pub async fn interrupted(&self) {
        self.interrupted.cancelled().await;
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.is_cancelled()
    }
}

struct PendingTurn {
    generation: u64,
    interrupted: CancellationToken,
}

struct TurnGate {
    generation: u64,
    pending: Option<PendingTurn>,
}

struct SessionEntry {
    adapter: Arc<dyn BackendAdapter>,
    gate: TurnGate,
}

/// Owns the adapter registry and the per-session turn gates.
pub struct SessionManager {
    hub: EventHub,
    adapters: RwLock<HashMap<&'static str, Arc<dyn BackendAdapter>>>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    retry: RetryPolicy,
    turn_timeout: Duration,
}

impl SessionManager {
    pub fn new(hub: EventHub) -> Self {
        Self {
            hub,
            adapters: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            retry: RetryPolicy::default(),
            turn_timeout: DEFAULT_TURN_TIMEOUT,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn turn_timeout(&self) -> Duration {
        self.turn_timeout
    }

    /// Register an adapter and bring up its transport.
    pub async fn register_adapter(&self, adapter: Arc<dyn BackendAdapter>) -> Result<()> {
        adapter.start().await?;
        tracing::info!(provider = adapter.id(), "adapter registered");
        self.adapters.write().await.insert(adapter.id(), adapter);
        Ok(())
    }

    pub async fn adapter(&self, provider: &str) -> Result<Arc<dyn BackendAdapter>> {
        self.adapters
            .read()
            .await
            .get(provider)
            .cloned()
            .ok_or_else(|| ConvoyError::UnknownProvider(provider.to_string()))
    }

    /// Adapter owning the given live session.
    pub async fn session_adapter(&self, session_id: &str) -> Result<Arc<dyn BackendAdapter>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.adapter.clone())
            .ok_or_else(|| ConvoyError::UnknownSession(session_id.to_string()))
    }

    pub async fn create_session(&self, provider: &str, config: SessionConfig) -> Result<String> {
        let adapter = self.adapter(provider).await?;
        let session_id = adapter.create_session(config).await?;
        self.sessions.write().await.insert(
            session_id.clone(),
            SessionEntry {
                adapter,
                gate: TurnGate {
                    generation: 0,
                    pending: None,
                },
            },
        );
        tracing::info!(provider, session_id, "session created");
        Ok(session_id)
    }

    /// Reattach to a backend session under its canonical id. Returns `None`
    /// when the backend no longer knows the id.
    pub async fn resume_session(
        &self,
        provider: &str,
        session_id: &str,
        config: SessionConfig,
    ) -> Result<Option<String>> {
        let adapter = self.adapter(provider).await?;
        if !adapter.capabilities().supports_resume {
            return Err(ConvoyError::Provider(ProviderError::Unsupported(
                "session resume".to_string(),
            )));
        }
        match adapter.resume_session(session_id, config).await {
            Ok(id) => {
                self.sessions.write().await.insert(
                    id.clone(),
                    SessionEntry {
                        adapter,
                        gate: TurnGate {
                            generation: 0,
                            pending: None,
                        },
                    },
                );
                tracing::info!(provider, session_id = %id, "session resumed");
                Ok(Some(id))
            }
            Err(ProviderError::UnknownSession(_)) => {
                tracing::warn!(provider, session_id, "backend no longer knows session");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Submit a prompt and claim the session's next turn generation.
    ///
    /// Cancel-previous, not FIFO: a pending turn is force-resolved as
    /// interrupted (token cancelled, adapter interrupted) before the new
    /// prompt goes out. Submission retries transport failures on the
    /// configured backoff schedule; a definitive failure releases the gate.
    pub async fn begin_turn(&self, session_id: &str, prompt: &str) -> Result<TurnToken> {
        let (adapter, superseded, token) = {
            let mut sessions = self.sessions.write().await;
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| ConvoyError::UnknownSession(session_id.to_string()))?;
            let superseded = entry.gate.pending.take();
            entry.gate.generation += 1;
            let interrupted = CancellationToken::new();
            entry.gate.pending = Some(PendingTurn {
                generation: entry.gate.generation,
                interrupted: interrupted.clone(),
            });
            let token = TurnToken {
                session_id: session_id.to_string(),
                generation: entry.gate.generation,
                interrupted,
                deadline: Instant::now() + self.turn_timeout,
            };
            (entry.adapter.clone(), superseded, token)
        };

        if let Some(previous) = superseded {
            tracing::info!(
                session_id,
                superseded = previous.generation,
                "superseding pending turn"
            );
            previous.interrupted.cancel();
            if let Err(err) = adapter.interrupt(session_id).await {
                tracing::warn!(session_id, error = %err, "interrupt of superseded turn failed");
            }
        }

        match self.submit_with_retry(&adapter, session_id, prompt).await {
            Ok(()) => Ok(token),
            Err(err) => {
                self.release_gate(session_id, token.generation).await;
                Err(err)
            }
        }
    }

    async fn submit_with_retry(
        &self,
        adapter: &Arc<dyn BackendAdapter>,
        session_id: &str,
        prompt: &str,
    ) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match adapter.send_prompt(session_id, prompt).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_recoverable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        session_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "prompt submission failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Interrupt the turn the token identifies. Stale tokens are a no-op
    /// returning false.
    pub async fn interrupt_turn(&self, token: &TurnToken) -> Result<bool> {
        let adapter = {
            let mut sessions = self.sessions.write().await;
            let Some(entry) = sessions.get_mut(&token.session_id) else {
                return Ok(false);
            };
            let matches = entry
                .gate
                .pending
                .as_ref()
                .is_some_and(|p| p.generation == token.generation);
            if !matches {
                return Ok(false);
            }
            if let Some(pending) = entry.gate.pending.take() {
                pending.interrupted.cancel();
            }
            entry.adapter.clone()
        };
        adapter.interrupt(&token.session_id).await?;
        Ok(true)
    }

    /// Release the gate for a turn that resolved through the event stream.
    /// Idempotent; a stale token leaves the current turn alone.
    pub async fn finish_turn(&self, token: &TurnToken) {
        self.release_gate(&token.session_id, token.generation).await;
    }

    async fn release_gate(&self, session_id: &str, generation: u64) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            let matches = entry
                .gate
                .pending
                .as_ref()
                .is_some_and(|p| p.generation == generation);
            if matches {
                entry.gate.pending = None;
            }
        }
    }

    /// This session's canonical events in sequence order.
    pub fn subscribe(&self, session_id: &str) -> SessionStream {
        SessionStream {
            session_id: session_id.to_string(),
            rx: self.hub.subscribe(),
            open: true,
        }
    }

    /// Interrupt any pending turn, release the backend session, and drop the
    /// gate. Later `begin_turn` calls fail with `UnknownSession`.
    pub async fn destroy(&self, session_id: &str) -> Result<()> {
        let Some(entry) = self.sessions.write().await.remove(session_id) else {
            return Err(ConvoyError::UnknownSession(session_id.to_string()));
        };
        if let Some(pending) = entry.gate.pending {
            pending.interrupted.cancel();
        }
        entry.adapter.destroy_session(session_id).await?;
        tracing::info!(session_id, "session destroyed");
        Ok(())
    }

    pub async fn context_usage(&self, session_id: &str) -> Result<Option<ContextUsage>> {
        let adapter = self.session_adapter(session_id).await?;
        Ok(adapter.context_usage(session_id).await?)
    }

    pub async fn register_tool(&self, session_id: &str, tool: ToolRegistration) -> Result<()> {
        let adapter = self.session_adapter(session_id).await?;
        Ok(adapter.register_tool(session_id, tool).await?)
    }

    /// Destroy every live session and stop the adapters. Failures are logged;
    /// shutdown keeps going.
    pub async fn shutdown(&self) {
        let session_ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for session_id in session_ids {
            if let Err(err) = self.destroy(&session_id).await {
                tracing::warn!(session_id, error = %err, "session teardown failed");
            }
        }
        let adapters: Vec<Arc<dyn BackendAdapter>> =
            self.adapters.write().await.drain().map(|(_, a)| a).collect();
        for adapter in adapters {
            if let Err(err) = adapter.stop().await {
                tracing::warn!(provider = adapter.id(), error = %err, "adapter stop failed");
            }
        }
    }
}

/// Per-session view over the hub: yields only the session's events, in
/// sequence order, until unsubscribed or the hub closes.
pub struct SessionStream {
    session_id: String,
    rx: broadcast::Receiver<AgentEvent>,
    open: bool,
}

impl SessionStream {
    pub async fn next(&mut self) -> Option<AgentEvent> {
        if !self.open {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(event) if event.session_id == self.session_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        skipped,
                        "session stream lagged behind the hub"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.open = false;
                    return None;
                }
            }
        }
    }

    /// Idempotent; safe to call after the session is destroyed.
    pub fn unsubscribe(&mut self) {
        self.open = false;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_providers::{MockBackend, MockEmit, MockTurn};
    use convoy_types::EventKind;

    async fn manager_with_mock() -> (Arc<SessionManager>, Arc<MockBackend>) {
        let hub = EventHub::new();
        let manager = SessionManager::new(hub.clone()).with_retry_policy(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        });
        let mock = Arc::new(MockBackend::new(hub.emitter()));
        manager
            .register_adapter(mock.clone())
            .await
            .expect("register");
        (Arc::new(manager), mock)
    }

    #[tokio::test]
    async fn second_turn_supersedes_the_first_as_interrupted() {
        let (manager, mock) = manager_with_mock().await;
        let session = manager
            .create_session("mock", SessionConfig::default())
            .await
            .expect("create");

        mock.push_turn(MockTurn::hang(vec![])).await;
        mock.push_turn(MockTurn::idle(vec![])).await;

        let first = manager.begin_turn(&session, "start").await.expect("turn 1");
        assert!(!first.is_interrupted());

        let second = manager.begin_turn(&session, "again").await.expect("turn 2");
        assert!(first.is_interrupted(), "superseded turn must be interrupted");
        assert!(!second.is_interrupted());
        assert_eq!(second.generation(), first.generation() + 1);
        assert_eq!(mock.interrupts().await, vec![session.clone()]);

        // The stale token no longer controls anything.
        assert!(!manager.interrupt_turn(&first).await.expect("stale"));
        assert!(manager.interrupt_turn(&second).await.expect("live"));
        assert!(!manager.interrupt_turn(&second).await.expect("repeat"));
    }

    #[tokio::test]
    async fn transport_failures_retry_within_budget() {
        let (manager, mock) = manager_with_mock().await;
        let session = manager
            .create_session("mock", SessionConfig::default())
            .await
            .expect("create");

        mock.fail_next_sends(1);
        mock.push_turn(MockTurn::idle(vec![])).await;
        let token = manager.begin_turn(&session, "go").await.expect("retried");
        assert_eq!(token.generation(), 1);
        // Both the failed and the successful submission are visible.
        assert_eq!(mock.prompts().await.len(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_release_the_gate() {
        let (manager, mock) = manager_with_mock().await;
        let session = manager
            .create_session("mock", SessionConfig::default())
            .await
            .expect("create");

        mock.fail_next_sends(3);
        let err = manager
            .begin_turn(&session, "doomed")
            .await
            .expect_err("budget exhausted");
        assert!(err.is_recoverable());

        // The gate is free again: the next turn does not interrupt anything.
        mock.push_turn(MockTurn::idle(vec![])).await;
        manager.begin_turn(&session, "retry").await.expect("clean");
        assert!(mock.interrupts().await.is_empty());
    }

    #[tokio::test]
    async fn destroy_interrupts_pending_turn_and_forgets_session() {
        let (manager, mock) = manager_with_mock().await;
        let session = manager
            .create_session("mock", SessionConfig::default())
            .await
            .expect("create");

        mock.push_turn(MockTurn::hang(vec![])).await;
        let token = manager.begin_turn(&session, "work").await.expect("turn");

        manager.destroy(&session).await.expect("destroy");
        assert!(token.is_interrupted());
        assert_eq!(mock.destroyed().await, vec![session.clone()]);

        let err = manager
            .begin_turn(&session, "too late")
            .await
            .expect_err("session gone");
        assert!(matches!(err, ConvoyError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn stream_filters_by_session_and_unsubscribe_is_idempotent() {
        let (manager, mock) = manager_with_mock().await;
        let ses_a = manager
            .create_session("mock", SessionConfig::default())
            .await
            .expect("a");
        let ses_b = manager
            .create_session("mock", SessionConfig::default())
            .await
            .expect("b");

        let mut stream = manager.subscribe(&ses_b);

        mock.push_turn(MockTurn::idle(vec![MockEmit::Text("from a".to_string())]))
            .await;
        mock.push_turn(MockTurn::idle(vec![MockEmit::Text("from b".to_string())]))
            .await;
        manager.begin_turn(&ses_a, "go").await.expect("turn a");
        manager.begin_turn(&ses_b, "go").await.expect("turn b");

        let first = stream.next().await.expect("event");
        assert_eq!(first.session_id, ses_b);
        assert_eq!(first.kind(), EventKind::MessageComplete);
        let second = stream.next().await.expect("idle");
        assert_eq!(second.kind(), EventKind::SessionIdle);

        stream.unsubscribe();
        assert!(stream.next().await.is_none());
        manager.destroy(&ses_b).await.expect("destroy");
        stream.unsubscribe();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn resume_reports_missing_sessions_as_none() {
        let (manager, mock) = manager_with_mock().await;

        mock.mark_resume_missing("ses_gone").await;
        let missing = manager
            .resume_session("mock", "ses_gone", SessionConfig::default())
            .await
            .expect("resume call");
        assert!(missing.is_none());

        let restored = manager
            .resume_session("mock", "ses_live", SessionConfig::default())
            .await
            .expect("resume call");
        assert_eq!(restored.as_deref(), Some("ses_live"));
        assert_eq!(mock.resumed().await, vec!["ses_live".to_string()]);
    }

    #[tokio::test]
    async fn unknown_provider_is_reported() {
        let (manager, _mock) = manager_with_mock().await;
        let err = manager
            .create_session("nonexistent", SessionConfig::default())
            .await
            .expect_err("no such provider");
        assert!(matches!(err, ConvoyError::UnknownProvider(_)));
    }
}
