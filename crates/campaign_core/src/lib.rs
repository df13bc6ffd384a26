use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex as StdMutex,
};

use delivery::{DeliveryEngine, EngineEvent, EngineProvider};
use shared::{
    domain::{CampaignMode, JobId, Nation, TelegramParams},
    protocol::{LogLevel, Notification},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;

/// Orchestrates one telegram campaign at a time.
///
/// Owns the session state machine: translates a recipient
/// specification plus message parameters into a delivery job, relays
/// engine events as presentation notifications, mediates
/// pause/unpause/cancel, and guarantees exactly one `Finished`
/// notification per session no matter which path ends it.
pub struct CampaignController {
    provider: Arc<dyn EngineProvider>,
    notifications: broadcast::Sender<Notification>,
    session: Mutex<Option<ActiveCampaign>>,
    paused: AtomicBool,
}

struct ActiveCampaign {
    engine: Arc<dyn DeliveryEngine>,
    flags: Arc<SessionFlags>,
    event_task: JoinHandle<()>,
}

/// Per-session bookkeeping, shared with that session's event pump.
/// Every handler reads its own session's flags, so a superseded
/// session can never misattribute events to the current one.
struct SessionFlags {
    /// Sticky once set; decides whether the terminal notification is
    /// tagged cancelled.
    cancel_requested: AtomicBool,
    /// Flips false-to-true exactly once; afterwards the session emits
    /// nothing further.
    shutdown_completed: AtomicBool,
    /// Valid only between successful resolution and completion.
    active_job: StdMutex<Option<JobId>>,
    verbose: bool,
}

impl SessionFlags {
    fn new(verbose: bool) -> Self {
        Self {
            cancel_requested: AtomicBool::new(false),
            shutdown_completed: AtomicBool::new(false),
            active_job: StdMutex::new(None),
            verbose,
        }
    }

    fn active_job(&self) -> Option<JobId> {
        *self
            .active_job
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_active_job(&self, job_id: JobId) {
        *self
            .active_job
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(job_id);
    }
}

impl CampaignController {
    pub fn new(provider: Arc<dyn EngineProvider>) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Arc::new(Self {
            provider,
            notifications,
            session: Mutex::new(None),
            paused: AtomicBool::new(false),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Begins a campaign session. Any session still active is
    /// superseded first: silenced and its engine handle released,
    /// before the new engine handle exists, so stale events cannot be
    /// misattributed.
    ///
    /// Returns once the engine has accepted the job or resolution has
    /// failed; the session's end is signalled by the `Finished`
    /// notification.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        &self,
        user_agent: &str,
        client_key: &str,
        recipient_spec: &str,
        params: TelegramParams,
        mode: CampaignMode,
        dry_run: bool,
        verbose: bool,
    ) {
        self.supersede_active().await;

        log(
            &self.notifications,
            LogLevel::Info,
            "Evaluating recipient specification...",
        );

        let engine = match self.provider.create_engine(user_agent, client_key).await {
            Ok(engine) => engine,
            Err(err) => {
                log(&self.notifications, LogLevel::Error, err.to_string());
                // no engine handle and no job: drive the terminal
                // notification ourselves
                notify(&self.notifications, Notification::Finished { cancelled: false });
                return;
            }
        };

        let flags = Arc::new(SessionFlags::new(verbose));
        // subscribe before the send request so early events are not lost
        let events = engine.subscribe_events();
        let event_task = tokio::spawn(run_event_pump(
            Arc::clone(&engine),
            Arc::clone(&flags),
            self.notifications.clone(),
            events,
        ));
        {
            let mut slot = self.session.lock().await;
            // a start racing through engine construction may have
            // installed a session since supersede_active ran; it loses
            if let Some(previous) = slot.take() {
                retire_session(previous);
            }
            *slot = Some(ActiveCampaign {
                engine: Arc::clone(&engine),
                flags: Arc::clone(&flags),
                event_task,
            });
        }

        match engine
            .send_to_specification(recipient_spec, params, mode.refreshes(), dry_run)
            .await
        {
            Ok(job_id) => {
                flags.set_active_job(job_id);
            }
            Err(err) => {
                log(&self.notifications, LogLevel::Error, err.to_string());
                // the engine never started a job, so no completion
                // event will arrive; terminate the session here
                complete_session(&engine, &flags, &self.notifications);
                self.discard_session_of(&flags).await;
            }
        }
    }

    /// Suspends delivery without dropping any recipient: queued and
    /// newly discovered recipients are both blocked until `unpause`.
    pub async fn pause(&self) {
        log(&self.notifications, LogLevel::Info, "Pausing...");
        self.paused.store(true, Ordering::SeqCst);
        if let Some(session) = self.session.lock().await.as_ref() {
            session.engine.set_block_existing(true).await;
            session.engine.set_block_new(true).await;
        }
    }

    pub async fn unpause(&self) {
        log(&self.notifications, LogLevel::Info, "Unpausing...");
        self.paused.store(false, Ordering::SeqCst);
        if let Some(session) = self.session.lock().await.as_ref() {
            session.engine.set_block_existing(false).await;
            session.engine.set_block_new(false).await;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Requests cooperative cancellation. The session keeps running
    /// until the engine acknowledges with its completion event, which
    /// is then reported as cancelled. Before a job exists the forward
    /// is dropped; the sticky flag still tags the eventual outcome.
    pub async fn cancel(&self) {
        log(&self.notifications, LogLevel::Info, "Cancelling...");
        let target = {
            let slot = self.session.lock().await;
            slot.as_ref().map(|session| {
                session.flags.cancel_requested.store(true, Ordering::SeqCst);
                (Arc::clone(&session.engine), session.flags.active_job())
            })
        };
        if let Some((engine, Some(job_id))) = target {
            engine.cancel_job(job_id).await;
        }
    }

    /// The reset barrier: takes the previous session out of service
    /// before anything about the next one is constructed.
    async fn supersede_active(&self) {
        let previous = self.session.lock().await.take();
        if let Some(previous) = previous {
            debug!("superseding active campaign session");
            retire_session(previous);
        }
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Drops the session slot if it still belongs to `flags`, aborting
    /// its pump. Used after the controller terminates a session itself
    /// and no more engine events can arrive.
    async fn discard_session_of(&self, flags: &Arc<SessionFlags>) {
        let mut slot = self.session.lock().await;
        let matches = slot
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(&active.flags, flags));
        if matches {
            if let Some(active) = slot.take() {
                active.event_task.abort();
            }
        }
    }
}

/// Takes a session out of service: its pump is aborted so it emits
/// nothing further, and its engine handle is released through the same
/// exactly-once guard as the terminal path.
fn retire_session(previous: ActiveCampaign) {
    previous.event_task.abort();
    if !previous
        .flags
        .shutdown_completed
        .swap(true, Ordering::SeqCst)
    {
        previous.engine.cleanup();
    }
}

fn notify(notifications: &broadcast::Sender<Notification>, notification: Notification) {
    let _ = notifications.send(notification);
}

fn log(
    notifications: &broadcast::Sender<Notification>,
    level: LogLevel,
    text: impl Into<String>,
) {
    let text = text.into();
    debug!("{text}");
    notify(notifications, Notification::Log { level, text });
}

async fn run_event_pump(
    engine: Arc<dyn DeliveryEngine>,
    flags: Arc<SessionFlags>,
    notifications: broadcast::Sender<Notification>,
    mut events: broadcast::Receiver<EngineEvent>,
) {
    loop {
        if flags.shutdown_completed.load(Ordering::SeqCst) {
            break;
        }
        match events.recv().await {
            Ok(EngineEvent::JobStarted { job_id }) => {
                on_job_start(&engine, &flags, &notifications, job_id).await;
            }
            Ok(EngineEvent::TelegramSent { nation }) => {
                notify(&notifications, Notification::RecipientSent { nation });
            }
            Ok(EngineEvent::TelegramFailed { nation, reason }) => {
                on_tg_failure(&flags, &notifications, nation, reason);
            }
            Ok(EngineEvent::NewRecipients { nations, .. }) => {
                notify(&notifications, Notification::NewRecipients { nations });
            }
            Ok(EngineEvent::JobCompleted) => {
                complete_session(&engine, &flags, &notifications);
                break;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("event pump lagged, skipped {skipped} engine events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn on_job_start(
    engine: &Arc<dyn DeliveryEngine>,
    flags: &Arc<SessionFlags>,
    notifications: &broadcast::Sender<Notification>,
    job_id: JobId,
) {
    let Some(snapshot) = engine.job(job_id).await else {
        // the engine reported a job it cannot look up: state
        // divergence, not recoverable
        log(
            notifications,
            LogLevel::Error,
            "Failed to identify telegram recipients.",
        );
        complete_session(engine, flags, notifications);
        return;
    };

    if snapshot.refresh {
        log(notifications, LogLevel::Info, "Continuous mode.");
        if snapshot.nations.is_empty() {
            notify(notifications, Notification::JobWaiting);
        } else {
            notify(
                notifications,
                Notification::JobSent {
                    nations: snapshot.nations,
                },
            );
        }
    } else {
        notify(
            notifications,
            Notification::JobSent {
                nations: snapshot.nations,
            },
        );
    }
}

fn on_tg_failure(
    flags: &SessionFlags,
    notifications: &broadcast::Sender<Notification>,
    nation: Nation,
    reason: String,
) {
    let detail = flags.verbose.then_some(reason);
    notify(
        notifications,
        Notification::RecipientFailed { nation, detail },
    );
}

/// The single terminal path. Idempotent: whichever of the completion
/// event, a forced shutdown, or a supersede gets here first wins; every
/// later call is a no-op.
fn complete_session(
    engine: &Arc<dyn DeliveryEngine>,
    flags: &SessionFlags,
    notifications: &broadcast::Sender<Notification>,
) {
    if flags.shutdown_completed.swap(true, Ordering::SeqCst) {
        return;
    }
    let cancelled = flags.cancel_requested.load(Ordering::SeqCst);
    log(
        notifications,
        LogLevel::Info,
        if cancelled {
            "Process cancelled."
        } else {
            "Process complete."
        },
    );
    engine.cleanup();
    notify(notifications, Notification::Finished { cancelled });
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
