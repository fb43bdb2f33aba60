//! Event logger: a sink that serialises records in its own thread. The
//! kernel hands it plain data and never blocks on file I/O inside a cycle;
//! the channel is the only coupling point.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::mpsc,
    thread::JoinHandle,
};

use super::{LOG_MAGIC, LOG_VERSION, record::LogRecord};
use crate::errors::PlanError;

enum LoggerMessage {
    Record(Box<LogRecord>),
    Flush(mpsc::SyncSender<()>),
    Shutdown,
}

/// Handle to the logging thread. Dropping it flushes and joins.
pub struct EventLogger {
    sender: mpsc::SyncSender<LoggerMessage>,
    worker: Option<JoinHandle<()>>,
}

impl EventLogger {
    /// Create the log file, write the header, and spawn the writer thread.
    pub fn create(path: impl AsRef<Path>, channel_size: usize) -> Result<Self, PlanError> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(LOG_MAGIC)?;
        writer.write_all(&LOG_VERSION.to_be_bytes())?;
        let (sender, receiver) = mpsc::sync_channel::<LoggerMessage>(channel_size);
        let worker = std::thread::Builder::new()
            .name("plan-event-log".to_string())
            .spawn(move || {
                for message in receiver {
                    match message {
                        LoggerMessage::Record(record) => {
                            if let Err(e) = writer.write_all(&record.to_frame()) {
                                tracing::warn!("event log write failed: {e}");
                            }
                        }
                        LoggerMessage::Flush(ack) => {
                            if let Err(e) = writer.flush() {
                                tracing::warn!("event log flush failed: {e}");
                            }
                            let _ = ack.send(());
                        }
                        LoggerMessage::Shutdown => break,
                    }
                }
                if let Err(e) = writer.flush() {
                    tracing::warn!("event log final flush failed: {e}");
                }
            })?;
        Ok(Self {
            sender,
            worker: Some(worker),
        })
    }

    /// Queue one record. Blocks only when the channel is full, which bounds
    /// memory instead of dropping frames.
    pub fn record(&self, record: LogRecord) {
        if self
            .sender
            .send(LoggerMessage::Record(Box::new(record)))
            .is_err()
        {
            tracing::warn!("event log thread is gone; record dropped");
        }
    }

    /// Block until everything queued so far reaches the file.
    pub fn flush(&self) {
        let (ack, done) = mpsc::sync_channel(1);
        if self.sender.send(LoggerMessage::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        let _ = self.sender.send(LoggerMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::EventLogger;
    use crate::internal::log::{LOG_MAGIC, record::LogRecord};

    /// The logger writes the header and queued frames to the file.
    #[test]
    fn test_logger_writes_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let logger = EventLogger::create(&path, 16).unwrap();
        logger.record(LogRecord::CycleStart {
            cycle: 0,
            time: Utc::now(),
        });
        logger.flush();
        drop(logger);

        let data = std::fs::read(&path).unwrap();
        assert!(data.starts_with(LOG_MAGIC));
        assert!(data.len() > LOG_MAGIC.len() + 4);
    }
}
