use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{JobId, JobSnapshot, Nation, TelegramKind, TelegramParams},
    error::EngineError,
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{DeliveryEngine, EngineEvent, RecipientResolver, Transport};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const BLOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum gap between recruitment telegram attempts (API fair-use
    /// floor).
    pub recruitment_rate: Duration,
    /// Minimum gap between non-recruitment telegram attempts.
    pub standard_rate: Duration,
    /// How often a refreshing job re-evaluates its specification.
    pub refresh_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recruitment_rate: Duration::from_secs(180),
            standard_rate: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(60),
        }
    }
}

/// Recipients a job has admitted so far, in announcement order. The
/// refresh loop diffs fresh evaluations against this set, so a nation
/// is announced and queued at most once per job.
struct RecipientLedger {
    ordered: Vec<Nation>,
    seen: HashSet<Nation>,
}

impl RecipientLedger {
    fn new() -> Self {
        Self {
            ordered: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn admit(&mut self, nations: Vec<Nation>) -> Vec<Nation> {
        let mut fresh = Vec::new();
        for nation in nations {
            if self.seen.insert(nation.clone()) {
                self.ordered.push(nation.clone());
                fresh.push(nation);
            }
        }
        fresh
    }
}

struct ActiveJob {
    refresh: bool,
    ledger: Arc<Mutex<RecipientLedger>>,
    cancel: watch::Sender<bool>,
    worker: JoinHandle<()>,
    refresh_task: Option<JoinHandle<()>>,
}

/// In-process delivery engine: one rate-gated worker per job, an
/// optional refresh loop for continuous jobs, cooperative cancel via a
/// watch flag the worker observes between attempts.
pub struct RateLimitedEngine {
    resolver: Arc<dyn RecipientResolver>,
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    events: broadcast::Sender<EngineEvent>,
    block_existing: Arc<AtomicBool>,
    block_new: Arc<AtomicBool>,
    jobs: Mutex<HashMap<JobId, ActiveJob>>,
    next_job_id: AtomicI64,
}

impl RateLimitedEngine {
    pub fn new(
        resolver: Arc<dyn RecipientResolver>,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            resolver,
            transport,
            config,
            events,
            block_existing: Arc::new(AtomicBool::new(false)),
            block_new: Arc::new(AtomicBool::new(false)),
            jobs: Mutex::new(HashMap::new()),
            next_job_id: AtomicI64::new(1),
        }
    }

    fn rate_for(&self, kind: TelegramKind) -> Duration {
        match kind {
            TelegramKind::Recruitment => self.config.recruitment_rate,
            TelegramKind::NonRecruitment => self.config.standard_rate,
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl DeliveryEngine for RateLimitedEngine {
    async fn send_to_specification(
        &self,
        spec: &str,
        params: TelegramParams,
        refresh: bool,
        dry_run: bool,
    ) -> Result<JobId, EngineError> {
        let initial = self.resolver.resolve(spec).await?;
        let job_id = JobId(self.next_job_id.fetch_add(1, Ordering::SeqCst));
        debug!(
            "starting delivery job id={} recipients={} refresh={refresh} dry_run={dry_run}",
            job_id.0,
            initial.len()
        );

        let ledger = Arc::new(Mutex::new(RecipientLedger::new()));
        let initial = lock_unpoisoned(&ledger).admit(initial);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(run_delivery_worker(
            DeliveryContext {
                params: params.clone(),
                dry_run,
                rate: self.rate_for(params.kind),
                transport: Arc::clone(&self.transport),
                events: self.events.clone(),
                block_existing: Arc::clone(&self.block_existing),
            },
            queue_rx,
            cancel_rx.clone(),
        ));

        let refresh_task = refresh.then(|| {
            tokio::spawn(run_refresh_loop(
                RefreshContext {
                    job_id,
                    spec: spec.to_string(),
                    resolver: Arc::clone(&self.resolver),
                    events: self.events.clone(),
                    block_new: Arc::clone(&self.block_new),
                    ledger: Arc::clone(&ledger),
                    queue: queue_tx.clone(),
                    interval: self.config.refresh_interval,
                },
                cancel_rx,
            ))
        });

        lock_unpoisoned(&self.jobs).insert(
            job_id,
            ActiveJob {
                refresh,
                ledger,
                cancel: cancel_tx,
                worker,
                refresh_task,
            },
        );

        // the snapshot is registered, so a JobStarted subscriber can
        // look the job up; only then may delivery begin
        let _ = self.events.send(EngineEvent::JobStarted { job_id });
        for nation in initial {
            let _ = queue_tx.send(nation);
        }
        // one-shot jobs complete once this queue drains; refreshing
        // jobs keep a sender alive inside the refresh loop
        drop(queue_tx);

        Ok(job_id)
    }

    async fn job(&self, job_id: JobId) -> Option<JobSnapshot> {
        let jobs = lock_unpoisoned(&self.jobs);
        let job = jobs.get(&job_id)?;
        let nations = lock_unpoisoned(&job.ledger).ordered.clone();
        Some(JobSnapshot {
            job_id,
            nations,
            refresh: job.refresh,
        })
    }

    async fn cancel_job(&self, job_id: JobId) {
        let jobs = lock_unpoisoned(&self.jobs);
        if let Some(job) = jobs.get(&job_id) {
            debug!("cancel requested for job id={}", job_id.0);
            let _ = job.cancel.send(true);
        }
    }

    async fn set_block_existing(&self, blocked: bool) {
        self.block_existing.store(blocked, Ordering::SeqCst);
    }

    async fn set_block_new(&self, blocked: bool) {
        self.block_new.store(blocked, Ordering::SeqCst);
    }

    fn cleanup(&self) {
        let mut jobs = lock_unpoisoned(&self.jobs);
        for (_, job) in jobs.drain() {
            job.worker.abort();
            if let Some(task) = job.refresh_task {
                task.abort();
            }
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

struct DeliveryContext {
    params: TelegramParams,
    dry_run: bool,
    rate: Duration,
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<EngineEvent>,
    block_existing: Arc<AtomicBool>,
}

async fn run_delivery_worker(
    ctx: DeliveryContext,
    mut queue: mpsc::UnboundedReceiver<Nation>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut gate = time::interval(ctx.rate);
    gate.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'deliver: loop {
        let nation = tokio::select! {
            _ = cancel.changed() => break 'deliver,
            next = queue.recv() => match next {
                Some(nation) => nation,
                None => break 'deliver,
            },
        };

        // hold (not drop) the recipient while existing deliveries are
        // blocked
        while ctx.block_existing.load(Ordering::SeqCst) {
            tokio::select! {
                _ = cancel.changed() => break 'deliver,
                _ = time::sleep(BLOCK_POLL_INTERVAL) => {}
            }
        }

        tokio::select! {
            _ = cancel.changed() => break 'deliver,
            _ = gate.tick() => {}
        }

        let outcome = if ctx.dry_run {
            Ok(())
        } else {
            ctx.transport.deliver(&nation, &ctx.params).await
        };
        match outcome {
            Ok(()) => {
                let _ = ctx.events.send(EngineEvent::TelegramSent { nation });
            }
            Err(err) => {
                warn!("telegram delivery failed nation={nation} error={err}");
                let _ = ctx.events.send(EngineEvent::TelegramFailed {
                    nation,
                    reason: err.to_string(),
                });
            }
        }
    }

    let _ = ctx.events.send(EngineEvent::JobCompleted);
}

struct RefreshContext {
    job_id: JobId,
    spec: String,
    resolver: Arc<dyn RecipientResolver>,
    events: broadcast::Sender<EngineEvent>,
    block_new: Arc<AtomicBool>,
    ledger: Arc<Mutex<RecipientLedger>>,
    queue: mpsc::UnboundedSender<Nation>,
    interval: Duration,
}

async fn run_refresh_loop(ctx: RefreshContext, mut cancel: watch::Receiver<bool>) {
    let mut ticker = time::interval_at(time::Instant::now() + ctx.interval, ctx.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // admitted and announced while block_new was set; queued for
    // delivery once it clears
    let mut deferred: Vec<Nation> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            _ = ticker.tick() => {}
        }

        if !ctx.block_new.load(Ordering::SeqCst) && !deferred.is_empty() {
            for nation in deferred.drain(..) {
                if ctx.queue.send(nation).is_err() {
                    return;
                }
            }
        }

        match ctx.resolver.resolve(&ctx.spec).await {
            Ok(nations) => {
                let fresh = lock_unpoisoned(&ctx.ledger).admit(nations);
                if fresh.is_empty() {
                    continue;
                }
                // discovery never stops: blocking admission defers the
                // telegrams, not the announcement
                let _ = ctx.events.send(EngineEvent::NewRecipients {
                    job_id: ctx.job_id,
                    nations: fresh.clone(),
                });
                if ctx.block_new.load(Ordering::SeqCst) {
                    deferred.extend(fresh);
                } else {
                    for nation in fresh {
                        if ctx.queue.send(nation).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(err) => warn!("recipient refresh failed: {err}"),
        }
    }
}
