//! Job monitoring sessions: one multiplexer fanning job state transitions
//! out to subscribers. Back-pressure is per-subscriber: a slow subscriber
//! drops intermediate update frames but always receives terminal-state
//! frames.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use super::types::{JobId, JobUpdate};

const SUBSCRIBER_QUEUE: usize = 64;

struct Subscriber {
    id: Uuid,
    sender: mpsc::Sender<JobUpdate>,
    dropped: u64,
}

/// A live subscription: the id to unsubscribe with and the update stream.
pub struct Subscription {
    pub id: Uuid,
    pub stream: ReceiverStream<JobUpdate>,
}

/// Fan-out registry of job subscribers, shared between the protocol
/// front-end and the kernel-side publisher.
#[derive(Default)]
pub struct JobSessions {
    subscribers: DashMap<JobId, Vec<Subscriber>>,
}

impl JobSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a job's state transitions.
    pub fn subscribe(&self, job: JobId) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = Uuid::new_v4();
        self.subscribers.entry(job).or_default().push(Subscriber {
            id,
            sender,
            dropped: 0,
        });
        Subscription {
            id,
            stream: ReceiverStream::new(receiver),
        }
    }

    pub fn unsubscribe(&self, job: JobId, id: Uuid) {
        if let Some(mut entry) = self.subscribers.get_mut(&job) {
            entry.retain(|s| s.id != id);
        }
    }

    /// Publish one transition to every subscriber of the job. Update frames
    /// are dropped for subscribers whose queue is full; terminal frames wait
    /// for space instead.
    pub async fn publish(&self, update: JobUpdate) {
        let Some(mut entry) = self.subscribers.get_mut(&update.job) else {
            return;
        };
        let mut closed: Vec<Uuid> = Vec::new();
        if update.state.is_terminal() {
            // collect the senders first so the shard lock is not held
            // across await points
            let senders: Vec<(Uuid, mpsc::Sender<JobUpdate>)> = entry
                .iter()
                .map(|s| (s.id, s.sender.clone()))
                .collect();
            drop(entry);
            for (id, sender) in senders {
                match sender.try_send(update.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(frame)) => {
                        // never lose a terminal frame and never block the
                        // publisher: deliver once the subscriber drains
                        tokio::spawn(async move {
                            let _ = sender.send(frame).await;
                        });
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
                }
            }
        } else {
            for subscriber in entry.iter_mut() {
                match subscriber.sender.try_send(update.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        subscriber.dropped += 1;
                        tracing::debug!(
                            "subscriber {} lagging on job {}: {} updates dropped",
                            subscriber.id,
                            update.job,
                            subscriber.dropped
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(subscriber.id),
                }
            }
            drop(entry);
        }
        if !closed.is_empty()
            && let Some(mut entry) = self.subscribers.get_mut(&update.job)
        {
            entry.retain(|s| !closed.contains(&s.id));
        }
    }

    /// Drop every subscriber of a job (after its terminal frame went out).
    pub fn close_job(&self, job: JobId) {
        self.subscribers.remove(&job);
    }

    pub fn subscriber_count(&self, job: JobId) -> usize {
        self.subscribers.get(&job).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;
    use uuid::Uuid;

    use super::JobSessions;
    use crate::protocol::types::{JobState, JobUpdate};

    fn update(job: Uuid, state: JobState) -> JobUpdate {
        JobUpdate {
            job,
            state,
            reason: None,
        }
    }

    /// Subscribers receive published transitions in order.
    #[tokio::test]
    async fn test_publish_order() {
        let sessions = JobSessions::new();
        let job = Uuid::new_v4();
        let mut subscription = sessions.subscribe(job);
        sessions.publish(update(job, JobState::Started)).await;
        sessions.publish(update(job, JobState::Finished)).await;
        assert_eq!(
            subscription.stream.next().await.unwrap().state,
            JobState::Started
        );
        assert_eq!(
            subscription.stream.next().await.unwrap().state,
            JobState::Finished
        );
    }

    /// A full subscriber queue drops updates but keeps terminal frames.
    #[tokio::test]
    async fn test_backpressure_keeps_terminal_frames() {
        let sessions = JobSessions::new();
        let job = Uuid::new_v4();
        let mut subscription = sessions.subscribe(job);
        for _ in 0..(super::SUBSCRIBER_QUEUE + 16) {
            sessions.publish(update(job, JobState::Started)).await;
        }
        sessions.publish(update(job, JobState::Finalized)).await;
        let mut last = None;
        while let Ok(Some(received)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), subscription.stream.next())
                .await
        {
            last = Some(received.state);
        }
        assert_eq!(last, Some(JobState::Finalized));
    }

    /// Unsubscribing stops delivery.
    #[tokio::test]
    async fn test_unsubscribe() {
        let sessions = JobSessions::new();
        let job = Uuid::new_v4();
        let subscription = sessions.subscribe(job);
        sessions.unsubscribe(job, subscription.id);
        assert_eq!(sessions.subscriber_count(job), 0);
    }
}
