//! Processors running outside the worker task.
//!
//! A [`Sandbox`] receives a serialized job and streams back progress, log
//! lines and exactly one result. [`SandboxedProcessor`] adapts it to the
//! [`Processor`] contract, so the worker treats sandboxed work like any
//! in-process callback. The isolation primitive (child process, thread
//! pool, remote runner) is up to the implementor.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::job::Job;
use crate::opts::JobOptions;
use crate::store::Store;

use super::processor::{JobContext, Processor};

/// Job as handed to a sandbox.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxJob {
    pub id: String,
    pub name: String,
    pub queue: String,
    pub data: Value,
    pub opts: JobOptions,
    pub attempts_made: u32,
    pub timestamp: i64,
}

impl From<&Job> for SandboxJob {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            name: job.name.clone(),
            queue: job.queue_name().to_string(),
            data: job.data.clone(),
            opts: job.opts.clone(),
            attempts_made: job.attempts_made,
            timestamp: job.timestamp,
        }
    }
}

/// Message sent by a running sandbox.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum SandboxMessage {
    Completed { value: Value },
    Failed { error: String },
    Progress { value: Value },
    Log { line: String },
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Start processing `job` (a serialized [`SandboxJob`]).
    async fn start(&self, job: String) -> anyhow::Result<mpsc::Receiver<SandboxMessage>>;
}

/// [`Processor`] backed by a [`Sandbox`].
pub struct SandboxedProcessor<X> {
    sandbox: Arc<X>,
}

impl<X> Clone for SandboxedProcessor<X> {
    fn clone(&self) -> Self {
        Self {
            sandbox: Arc::clone(&self.sandbox),
        }
    }
}

impl<X> std::fmt::Debug for SandboxedProcessor<X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxedProcessor")
            .field("sandbox_type", &std::any::type_name::<X>())
            .finish()
    }
}

impl<X: Sandbox> SandboxedProcessor<X> {
    pub fn new(sandbox: Arc<X>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl<S: Store, X: Sandbox + 'static> Processor<S> for SandboxedProcessor<X> {
    async fn process(&self, mut ctx: JobContext<S>) -> anyhow::Result<Value> {
        let payload = serde_json::to_string(&SandboxJob::from(ctx.job()))?;
        let mut messages = self.sandbox.start(payload).await?;
        while let Some(message) = messages.recv().await {
            match message {
                SandboxMessage::Completed { value } => return Ok(value),
                SandboxMessage::Failed { error } => return Err(anyhow::anyhow!(error)),
                SandboxMessage::Progress { value } => ctx.update_progress(value).await?,
                SandboxMessage::Log { line } => {
                    ctx.log(line).await?;
                }
            }
        }
        anyhow::bail!("sandbox exited without a result")
    }
}
