//! Request/response types of the control protocol and the job state
//! machine surfaced to monitoring clients.

use std::{fmt, pin::Pin, str::FromStr};

use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::internal::plan::PlanSnapshot;

/// Type alias for job update streams to reduce nesting.
pub type UpdateStream = Pin<Box<dyn Stream<Item = JobUpdate> + Send>>;

/// Protocol error types.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Unknown job: {0}")]
    UnknownJob(JobId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlError {
    pub fn invalid_request(message: &str) -> Self {
        ControlError::InvalidRequest(message.to_string())
    }

    pub fn internal(message: String) -> Self {
        ControlError::Internal(message)
    }
}

/// Identifier of a job started through the protocol.
pub type JobId = Uuid;

/// Job lifecycle surfaced to monitoring subscribers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// The action is known and its planning can start.
    PlanningReady,
    /// Planning in progress.
    Planning,
    /// Plan produced; execution can start.
    Ready,
    /// The job's task started.
    Started,
    /// The job's task emitted its success event.
    Success,
    /// The job's task terminated without success.
    Failed,
    /// The job's task emitted stop.
    Finished,
    /// The job's task was removed from the plan.
    Finalized,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::PlanningReady => "planning-ready",
            JobState::Planning => "planning",
            JobState::Ready => "ready",
            JobState::Started => "started",
            JobState::Success => "success",
            JobState::Failed => "failed",
            JobState::Finished => "finished",
            JobState::Finalized => "finalized",
        }
    }

    /// Terminal-state frames are never dropped by back-pressure.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failed | JobState::Finished | JobState::Finalized
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = ControlError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "planning-ready" => Ok(JobState::PlanningReady),
            "planning" => Ok(JobState::Planning),
            "ready" => Ok(JobState::Ready),
            "started" => Ok(JobState::Started),
            "success" => Ok(JobState::Success),
            "failed" => Ok(JobState::Failed),
            "finished" => Ok(JobState::Finished),
            "finalized" => Ok(JobState::Finalized),
            _ => Err(ControlError::InvalidRequest(format!(
                "unknown job state: {value}"
            ))),
        }
    }
}

/// One state transition of a monitored job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub job: JobId,
    pub state: JobState,
    /// Structured reason for failure-like transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One declared argument of an action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionArgument {
    pub name: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

/// One action exposed by the application.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionDescription {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    #[serde(default)]
    pub arguments: Vec<ActionArgument>,
}

/// Requests of the control protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    ListActions,
    StartJob {
        action: String,
        #[serde(default)]
        arguments: Value,
    },
    Monitor {
        job: JobId,
    },
    Kill {
        job: JobId,
    },
    Drop {
        job: JobId,
    },
    Batch {
        requests: Vec<ControlRequest>,
    },
    PlanSnapshot,
}

/// Responses of the control protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlResponse {
    Actions { actions: Vec<ActionDescription> },
    JobStarted { job: JobId },
    JobUpdate { update: JobUpdate },
    Ack,
    Error { message: String },
    Snapshot { snapshot: PlanSnapshot },
    Batch { responses: Vec<ControlResponse> },
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{ControlRequest, JobState};

    /// Job states round-trip through their kebab-case names.
    #[test]
    fn test_job_state_round_trip() {
        for state in [
            JobState::PlanningReady,
            JobState::Planning,
            JobState::Ready,
            JobState::Started,
            JobState::Success,
            JobState::Failed,
            JobState::Finished,
            JobState::Finalized,
        ] {
            assert_eq!(JobState::from_str(state.as_str()).unwrap(), state);
        }
        assert!(JobState::from_str("nope").is_err());
    }

    /// Terminal classification drives back-pressure decisions.
    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Started.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Finalized.is_terminal());
    }

    /// Requests serialize as tagged JSON objects.
    #[test]
    fn test_request_encoding() {
        let request = ControlRequest::StartJob {
            action: "move_to".to_string(),
            arguments: serde_json::json!({"goal": [10, 20]}),
        };
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded["op"], "start_job");
        let decoded: ControlRequest = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, request);
    }
}
