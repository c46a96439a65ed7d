//! Host agent lifecycle hooks
//!
//! The host calls these around each turn and before it compacts its context.
//! Every hook is infallible from the host's point of view.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use mnemos_core::Turn;
use mnemos_memory::{ContextBlock, PreCompaction};

#[async_trait]
pub trait HostHooks: Send + Sync {
    /// Before generation. A returned block is injected ahead of the turn.
    async fn on_turn_start(&self, _turn: &Turn) -> Option<ContextBlock> {
        None
    }

    /// After the response has been delivered; `turn.response` is set.
    async fn on_turn_end(&self, _turn: &Turn) {}

    async fn on_pre_compaction(&self, _event: &PreCompaction) {}

    async fn on_session_end(&self, _owner_id: &str) {}
}

pub struct NoopHooks;

#[async_trait]
impl HostHooks for NoopHooks {}

pub struct LoggingHooks {
    prefix: String,
}

impl LoggingHooks {
    pub fn new() -> Self {
        Self {
            prefix: "[Host]".to_string(),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LoggingHooks {
    fn default() -> Self {
        Self::new()
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > 100 {
        format!("{}...", text.chars().take(100).collect::<String>())
    } else {
        text.to_string()
    }
}

#[async_trait]
impl HostHooks for LoggingHooks {
    async fn on_turn_start(&self, turn: &Turn) -> Option<ContextBlock> {
        info!(
            "{} Turn start for {}: {}",
            self.prefix,
            turn.owner_id,
            preview(&turn.text)
        );
        None
    }

    async fn on_turn_end(&self, turn: &Turn) {
        debug!(
            "{} Turn end for {}: {}",
            self.prefix,
            turn.owner_id,
            turn.response.as_deref().map(preview).unwrap_or_default()
        );
    }

    async fn on_pre_compaction(&self, event: &PreCompaction) {
        info!(
            "{} Pre-compaction for {} (transcript {:?})",
            self.prefix, event.owner_id, event.transcript_ref
        );
    }

    async fn on_session_end(&self, owner_id: &str) {
        info!("{} Session end for {}", self.prefix, owner_id);
    }
}

/// Fans every event out to each member in order. The first block returned
/// from `on_turn_start` wins; later members still see the event.
pub struct CompositeHooks {
    hooks: Vec<Arc<dyn HostHooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add(mut self, hooks: Arc<dyn HostHooks>) -> Self {
        self.hooks.push(hooks);
        self
    }

    pub fn with_hooks(hooks: Vec<Arc<dyn HostHooks>>) -> Self {
        Self { hooks }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl Default for CompositeHooks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostHooks for CompositeHooks {
    async fn on_turn_start(&self, turn: &Turn) -> Option<ContextBlock> {
        let mut block = None;
        for hook in &self.hooks {
            let result = hook.on_turn_start(turn).await;
            if block.is_none() {
                block = result;
            }
        }
        block
    }

    async fn on_turn_end(&self, turn: &Turn) {
        for hook in &self.hooks {
            hook.on_turn_end(turn).await;
        }
    }

    async fn on_pre_compaction(&self, event: &PreCompaction) {
        for hook in &self.hooks {
            hook.on_pre_compaction(event).await;
        }
    }

    async fn on_session_end(&self, owner_id: &str) {
        for hook in &self.hooks {
            hook.on_session_end(owner_id).await;
        }
    }
}

/// Holds `on_turn_start` of the wrapped hooks to a latency budget. A block
/// that is not ready in time is abandoned and the turn goes ahead without
/// memory. Other events pass through untimed.
pub struct BudgetedHooks<H> {
    inner: H,
    budget: Duration,
}

impl<H: HostHooks> BudgetedHooks<H> {
    pub fn new(inner: H, budget: Duration) -> Self {
        Self { inner, budget }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

#[async_trait]
impl<H: HostHooks> HostHooks for BudgetedHooks<H> {
    async fn on_turn_start(&self, turn: &Turn) -> Option<ContextBlock> {
        let started = Instant::now();
        match tokio::time::timeout(self.budget, self.inner.on_turn_start(turn)).await {
            Ok(block) => {
                debug!(
                    "[hooks] turn start for {} in {}ms",
                    turn.owner_id,
                    started.elapsed().as_millis()
                );
                block
            }
            Err(_) => {
                warn!(
                    "[hooks] turn start for {} exceeded {}ms; continuing without memory",
                    turn.owner_id,
                    self.budget.as_millis()
                );
                None
            }
        }
    }

    async fn on_turn_end(&self, turn: &Turn) {
        self.inner.on_turn_end(turn).await;
    }

    async fn on_pre_compaction(&self, event: &PreCompaction) {
        self.inner.on_pre_compaction(event).await;
    }

    async fn on_session_end(&self, owner_id: &str) {
        self.inner.on_session_end(owner_id).await;
    }
}
