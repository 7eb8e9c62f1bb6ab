use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::config::RetryPolicy;
use crate::error::Result;
use crate::registry::{ResizeOutcome, SessionRegistry};
use crate::session::{SessionKey, SessionKind, TerminalSize};
use crate::view::TerminalView;

/// Backend channel a resize travels on. Agent terminals and quick shells are
/// separate processes and must never receive each other's sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeChannel {
    AgentPty,
    QuickShell,
}

impl SessionKind {
    pub fn resize_channel(self) -> ResizeChannel {
        match self {
            SessionKind::PrimaryAgent => ResizeChannel::AgentPty,
            SessionKind::AdHocShell => ResizeChannel::QuickShell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeTrigger {
    Mount,
    ContainerResized,
    /// Full-screen toggle, split panel shown or hidden.
    LayoutToggled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FitOutcome {
    Resized {
        channel: ResizeChannel,
        outcome: ResizeOutcome,
    },
    /// The view never reported a non-empty size.
    GaveUp { attempts: u32 },
}

/// Fits views to their container and pushes the resulting grid to the
/// session's process.
#[derive(Clone)]
pub struct ResizeCoordinator {
    registry: Arc<SessionRegistry>,
    policy: RetryPolicy,
}

impl ResizeCoordinator {
    pub fn new(registry: Arc<SessionRegistry>, policy: RetryPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Measures `view` and resizes the session behind `key`.
    ///
    /// While the view reports an empty size it is measured again after the
    /// policy's delay, at most `max_attempts` times in total.
    pub async fn fit(
        &self,
        key: &SessionKey,
        view: &dyn TerminalView,
        trigger: ResizeTrigger,
    ) -> Result<FitOutcome> {
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 0..attempts {
            if let Some(size) = view.fit().filter(|s| !s.is_empty()) {
                debug!(key = %key, trigger = ?trigger, size = %size, attempt, "Fitted view");
                return self.apply(key, size).await;
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.policy.delay_after(attempt)).await;
            }
        }
        debug!(key = %key, trigger = ?trigger, attempts, "View never acquired a size");
        Ok(FitOutcome::GaveUp { attempts })
    }

    /// Pushes an already measured size.
    pub async fn apply(&self, key: &SessionKey, size: TerminalSize) -> Result<FitOutcome> {
        let outcome = self.registry.request_resize(key, size).await?;
        Ok(FitOutcome::Resized {
            channel: key.kind.resize_channel(),
            outcome,
        })
    }
}
