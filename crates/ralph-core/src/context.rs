//! The execution context: configuration snapshot plus shared component
//! handles, threaded explicitly through every subsystem. There is no
//! process-global state.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::RunConfig;
use crate::events::EventBus;
use crate::limiter::RateLimiter;
use crate::session::SessionManager;
use crate::task::source::TaskSource;

/// Everything a component needs to participate in a run.
#[derive(Clone)]
pub struct ExecutionContext {
    /// The trunk repository root (and sequential-mode working tree).
    pub repo_root: PathBuf,
    /// Configuration snapshot taken once at startup.
    pub config: Arc<RunConfig>,
    pub source: Arc<TaskSource>,
    pub sessions: Arc<SessionManager>,
    pub limiter: Arc<RateLimiter>,
    pub events: EventBus,
}

impl ExecutionContext {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        config: RunConfig,
        source: TaskSource,
        sessions: SessionManager,
    ) -> Self {
        let limiter = RateLimiter::new();
        for (slot, limit) in &config.factory.slot_limits {
            if let Some((provider, model)) = slot.split_once(':') {
                limiter.configure_slot(provider, model, *limit);
            }
        }
        Self {
            repo_root: repo_root.into(),
            config: Arc::new(config),
            source: Arc::new(source),
            sessions: Arc::new(sessions),
            limiter: Arc::new(limiter),
            events: EventBus::default(),
        }
    }
}
