use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{JobId, JobSnapshot, Nation, TelegramParams},
    error::EngineError,
};
use tokio::sync::broadcast;

pub mod engine;
pub mod resolver;
pub mod transport;

pub use engine::{EngineConfig, RateLimitedEngine};
pub use resolver::{ListResolver, RecipientResolver};
pub use transport::{HttpTransport, NoopTransport, Transport};

/// Events emitted on a delivery engine's broadcast stream.
///
/// Ordering contract: exactly one `JobStarted` precedes every other
/// event of its job, and `JobCompleted` is the final event for the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    JobStarted { job_id: JobId },
    TelegramSent { nation: Nation },
    TelegramFailed { nation: Nation, reason: String },
    NewRecipients { job_id: JobId, nations: Vec<Nation> },
    JobCompleted,
}

/// The delivery engine surface the campaign controller drives.
///
/// Subscribe to the event stream before issuing the send request, or
/// early job events may be missed.
#[async_trait]
pub trait DeliveryEngine: Send + Sync {
    /// Evaluates the recipient specification and starts a delivery job.
    /// With `refresh`, the specification is re-evaluated periodically
    /// and newly discovered recipients join the job.
    async fn send_to_specification(
        &self,
        spec: &str,
        params: TelegramParams,
        refresh: bool,
        dry_run: bool,
    ) -> Result<JobId, EngineError>;

    async fn job(&self, job_id: JobId) -> Option<JobSnapshot>;

    /// Requests cooperative cancellation. Fire-and-forget: the job
    /// still emits `JobCompleted` once it winds down.
    async fn cancel_job(&self, job_id: JobId);

    /// Blocks or unblocks delivery attempts for already-queued
    /// recipients. Held recipients are not dropped.
    async fn set_block_existing(&self, blocked: bool);

    /// Blocks or unblocks admission of newly discovered recipients.
    async fn set_block_new(&self, blocked: bool);

    /// Releases engine-held resources. Must be called exactly once per
    /// constructed handle before it is discarded.
    fn cleanup(&self);

    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent>;
}

/// Factory seam: the controller constructs a fresh engine handle per
/// campaign session.
#[async_trait]
pub trait EngineProvider: Send + Sync {
    async fn create_engine(
        &self,
        user_agent: &str,
        client_key: &str,
    ) -> Result<Arc<dyn DeliveryEngine>, EngineError>;
}

pub struct MissingEngineProvider;

#[async_trait]
impl EngineProvider for MissingEngineProvider {
    async fn create_engine(
        &self,
        _user_agent: &str,
        _client_key: &str,
    ) -> Result<Arc<dyn DeliveryEngine>, EngineError> {
        Err(EngineError::Provider {
            message: "delivery engine provider is unavailable".into(),
        })
    }
}

/// Builds rate-limited engines that deliver over HTTP to the telegram
/// API, evaluating recipient specifications with the list evaluator.
pub struct HttpEngineProvider {
    api_base_url: String,
    config: EngineConfig,
}

impl HttpEngineProvider {
    pub fn new(api_base_url: impl Into<String>, config: EngineConfig) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            config,
        }
    }
}

#[async_trait]
impl EngineProvider for HttpEngineProvider {
    async fn create_engine(
        &self,
        user_agent: &str,
        client_key: &str,
    ) -> Result<Arc<dyn DeliveryEngine>, EngineError> {
        let agent = format!("tgcast (currently used by \"{user_agent}\")");
        let transport = HttpTransport::new(&self.api_base_url, &agent, client_key)
            .map_err(|err| EngineError::Provider {
                message: format!("{err:#}"),
            })?;
        Ok(Arc::new(RateLimitedEngine::new(
            Arc::new(ListResolver),
            Arc::new(transport),
            self.config.clone(),
        )))
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
