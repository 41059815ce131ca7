use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::AppContext;
use crate::core::messages::Notification;
use crate::logging::ProgressThrottle;

/// Feeds worker notifications into the registry, one at a time and in the
/// order the worker sent them.
pub struct Orchestrator {
    ctx: AppContext,
    throttle: ProgressThrottle,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            throttle: ProgressThrottle::new(Duration::from_secs(2)),
        }
    }

    /// Run until the worker side of the channel closes or `shutdown` fires.
    pub async fn run(
        &mut self,
        mut notifications: mpsc::Receiver<Notification>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        info!("Notification loop started");

        loop {
            tokio::select! {
                received = notifications.recv() => match received {
                    Some(notification) => self.handle(notification).await,
                    None => {
                        info!("Worker notification channel closed");
                        break;
                    }
                },
                _ = shutdown.cancelled() => {
                    info!("Notification loop shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    pub async fn handle(&mut self, notification: Notification) {
        if let Notification::Running { id, message } = &notification {
            if self.throttle.should_log(*id) {
                debug!(
                    job_id = %id,
                    frame = ?message.frame,
                    speed = ?message.speed,
                    ratio = ?message.ratio(),
                    "Progress"
                );
            }
        } else {
            self.throttle.forget(notification.id());
        }

        self.ctx.registry.dispatch_notification(notification).await;
    }
}
