//! Core control protocol implementation.
//!
//! This module provides the main `ControlProtocol` struct and the
//! `ActionProvider` trait that form the application-facing interface of the
//! protocol layer. The provider only handles application-level operations
//! (starting jobs, killing them, snapshotting the plan); the protocol layer
//! handles all framing, parsing, and subscriber multiplexing.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use super::{
    session::{JobSessions, Subscription},
    types::{
        ActionDescription, ControlError, ControlRequest, ControlResponse, JobId,
    },
    utils::{decode_message, encode_message, read_frame},
};
use crate::internal::plan::PlanSnapshot;

/// Application access trait for job operations.
///
/// This trait only handles application-level operations, not protocol
/// details; the protocol layer does all formatting and parsing. Implemented
/// by the process that owns the execution engine.
#[async_trait]
pub trait ActionProvider: Send + Sync {
    /// Actions the application can start.
    async fn list_actions(&self) -> Result<Vec<ActionDescription>, ControlError>;

    /// Start an action with arguments, returning the job id.
    async fn start(
        &self,
        action: &str,
        arguments: serde_json::Value,
    ) -> Result<JobId, ControlError>;

    /// Stop a job's task (its terminal event is called).
    async fn kill(&self, job: JobId) -> Result<(), ControlError>;

    /// Drop a job: unmark it as a mission without stopping it.
    async fn drop_job(&self, job: JobId) -> Result<(), ControlError>;

    /// Read-only structural snapshot of the current plan.
    async fn snapshot(&self) -> Result<PlanSnapshot, ControlError>;

    /// Run a batch of requests atomically with respect to observation.
    ///
    /// The default implementation dispatches sequentially; engine-backed
    /// providers override it to apply the whole batch within one cycle
    /// boundary.
    async fn run_batch(
        &self,
        requests: Vec<ControlRequest>,
    ) -> Result<Vec<ControlResponse>, ControlError> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(dispatch_simple(self, request).await);
        }
        Ok(responses)
    }
}

/// Dispatch one non-streaming request against a provider.
async fn dispatch_simple<P: ActionProvider + ?Sized>(
    provider: &P,
    request: ControlRequest,
) -> ControlResponse {
    let result: Result<ControlResponse, ControlError> = match request {
        ControlRequest::ListActions => provider
            .list_actions()
            .await
            .map(|actions| ControlResponse::Actions { actions }),
        ControlRequest::StartJob { action, arguments } => provider
            .start(&action, arguments)
            .await
            .map(|job| ControlResponse::JobStarted { job }),
        ControlRequest::Kill { job } => provider.kill(job).await.map(|()| ControlResponse::Ack),
        ControlRequest::Drop { job } => {
            provider.drop_job(job).await.map(|()| ControlResponse::Ack)
        }
        ControlRequest::PlanSnapshot => provider
            .snapshot()
            .await
            .map(|snapshot| ControlResponse::Snapshot { snapshot }),
        ControlRequest::Monitor { .. } => Err(ControlError::invalid_request(
            "monitor cannot be nested in a batch",
        )),
        ControlRequest::Batch { .. } => Err(ControlError::invalid_request(
            "batches cannot be nested",
        )),
    };
    match result {
        Ok(response) => response,
        Err(error) => ControlResponse::Error {
            message: error.to_string(),
        },
    }
}

/// Transport-agnostic control protocol handler.
///
/// Works across TCP, Unix sockets, or in-process transports: the caller
/// feeds request frames in and writes response frames out. Monitoring
/// subscriptions are handed back as streams for the transport to drain.
pub struct ControlProtocol<P: ActionProvider> {
    provider: P,
    sessions: Arc<JobSessions>,
}

impl<P: ActionProvider> ControlProtocol<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            sessions: Arc::new(JobSessions::new()),
        }
    }

    /// The session registry; the kernel-side publisher clones this to push
    /// job transitions.
    pub fn sessions(&self) -> Arc<JobSessions> {
        self.sessions.clone()
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Handle one framed request buffer, returning the framed response.
    pub async fn handle_frame(&self, mut frame: Bytes) -> Result<BytesMut, ControlError> {
        let (consumed, payload) = read_frame(&mut frame);
        if consumed == 0 {
            return Err(ControlError::invalid_request("incomplete frame"));
        }
        let request: ControlRequest = decode_message(&payload)?;
        let response = self.handle_request(request).await;
        encode_message(&response)
    }

    /// Handle one decoded request.
    pub async fn handle_request(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Batch { requests } => {
                match self.provider.run_batch(requests).await {
                    Ok(responses) => ControlResponse::Batch { responses },
                    Err(error) => ControlResponse::Error {
                        message: error.to_string(),
                    },
                }
            }
            ControlRequest::Monitor { .. } => ControlResponse::Error {
                message: "monitor requires a streaming transport; use subscribe()".to_string(),
            },
            other => dispatch_simple(&self.provider, other).await,
        }
    }

    /// Open a monitoring subscription for a job.
    pub fn subscribe(&self, job: JobId) -> Subscription {
        self.sessions.subscribe(job)
    }

    /// Open a monitoring subscription as a boxed stream, for transports
    /// that multiplex several jobs over one connection.
    pub fn monitor(&self, job: JobId) -> super::types::UpdateStream {
        Box::pin(self.sessions.subscribe(job).stream)
    }
}
