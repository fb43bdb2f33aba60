//! Log record encoding: one tagged union per frame, all integers
//! big-endian, timestamps as microseconds since the Unix epoch, digests as
//! raw 20-byte strings.
//!
//! Frame layout: `u32 length | u8 tag | payload`, where `length` covers tag
//! and payload. Unknown tags decode to `None` so newer writers stay
//! readable.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, TimeZone, Utc};

use crate::{errors::PlanError, ident::Digest, utils::read_bytes};

const TAG_CYCLE_START: u8 = 0;
const TAG_CYCLE_END: u8 = 1;
const TAG_TASK_ADDED: u8 = 2;
const TAG_TASK_FINALIZED: u8 = 3;
const TAG_EVENT_EMITTED: u8 = 4;
const TAG_EVENT_UNREACHABLE: u8 = 5;
const TAG_EDGE_ADDED: u8 = 6;
const TAG_EDGE_REMOVED: u8 = 7;
const TAG_EXCEPTION: u8 = 8;
const TAG_TASK_EVENT_BOUND: u8 = 9;

/// Per-cycle statistics carried by the cycle-end record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub duration_us: u64,
    pub emissions: u32,
    pub errors: u32,
}

/// One event log record.
#[derive(Clone, Debug, PartialEq)]
pub enum LogRecord {
    CycleStart {
        cycle: u64,
        time: DateTime<Utc>,
    },
    CycleEnd {
        cycle: u64,
        time: DateTime<Utc>,
        stats: CycleStats,
    },
    TaskAdded {
        task: u64,
        model_digest: Digest,
        arguments_digest: Digest,
        time: DateTime<Utc>,
    },
    TaskFinalized {
        task: u64,
        time: DateTime<Utc>,
    },
    EventEmitted {
        generator: u64,
        context_digest: Digest,
        sources: Vec<(u64, u32)>,
        time: DateTime<Utc>,
    },
    EventUnreachable {
        generator: u64,
        reason_digest: Digest,
        time: DateTime<Utc>,
    },
    EdgeAdded {
        relation: u8,
        parent: u64,
        child: u64,
        info_digest: Digest,
    },
    EdgeRemoved {
        relation: u8,
        parent: u64,
        child: u64,
    },
    Exception {
        matcher_digest: Digest,
        failure_point: u64,
        status: u8,
    },
    /// Additive record binding a task's event symbol to its generator id;
    /// what makes lifecycle replay possible from generator-level records.
    TaskEventBound {
        task: u64,
        symbol: String,
        generator: u64,
    },
}

fn write_time(buffer: &mut Vec<u8>, time: &DateTime<Utc>) {
    let _ = buffer.write_i64::<BigEndian>(time.timestamp_micros());
}

fn read_time(cursor: &mut Cursor<&[u8]>) -> Result<DateTime<Utc>, PlanError> {
    let micros = cursor.read_i64::<BigEndian>()?;
    Utc.timestamp_micros(micros)
        .single()
        .ok_or_else(|| PlanError::InvalidLogRecord(format!("timestamp {micros}")))
}

fn write_digest(buffer: &mut Vec<u8>, digest: &Digest) {
    let _ = buffer.write_all(digest.as_bytes());
}

fn read_digest(cursor: &mut Cursor<&[u8]>) -> Result<Digest, PlanError> {
    let bytes = read_bytes(cursor, Digest::SIZE)?;
    Digest::from_bytes(&bytes).map_err(PlanError::InvalidLogRecord)
}

impl LogRecord {
    /// Encode into one length-prefixed frame.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            LogRecord::CycleStart { cycle, time } => {
                payload.push(TAG_CYCLE_START);
                let _ = payload.write_u64::<BigEndian>(*cycle);
                write_time(&mut payload, time);
            }
            LogRecord::CycleEnd { cycle, time, stats } => {
                payload.push(TAG_CYCLE_END);
                let _ = payload.write_u64::<BigEndian>(*cycle);
                write_time(&mut payload, time);
                let _ = payload.write_u64::<BigEndian>(stats.duration_us);
                let _ = payload.write_u32::<BigEndian>(stats.emissions);
                let _ = payload.write_u32::<BigEndian>(stats.errors);
            }
            LogRecord::TaskAdded {
                task,
                model_digest,
                arguments_digest,
                time,
            } => {
                payload.push(TAG_TASK_ADDED);
                let _ = payload.write_u64::<BigEndian>(*task);
                write_digest(&mut payload, model_digest);
                write_digest(&mut payload, arguments_digest);
                write_time(&mut payload, time);
            }
            LogRecord::TaskFinalized { task, time } => {
                payload.push(TAG_TASK_FINALIZED);
                let _ = payload.write_u64::<BigEndian>(*task);
                write_time(&mut payload, time);
            }
            LogRecord::EventEmitted {
                generator,
                context_digest,
                sources,
                time,
            } => {
                payload.push(TAG_EVENT_EMITTED);
                let _ = payload.write_u64::<BigEndian>(*generator);
                write_digest(&mut payload, context_digest);
                let _ = payload.write_u32::<BigEndian>(sources.len() as u32);
                for (source, index) in sources {
                    let _ = payload.write_u64::<BigEndian>(*source);
                    let _ = payload.write_u32::<BigEndian>(*index);
                }
                write_time(&mut payload, time);
            }
            LogRecord::EventUnreachable {
                generator,
                reason_digest,
                time,
            } => {
                payload.push(TAG_EVENT_UNREACHABLE);
                let _ = payload.write_u64::<BigEndian>(*generator);
                write_digest(&mut payload, reason_digest);
                write_time(&mut payload, time);
            }
            LogRecord::EdgeAdded {
                relation,
                parent,
                child,
                info_digest,
            } => {
                payload.push(TAG_EDGE_ADDED);
                payload.push(*relation);
                let _ = payload.write_u64::<BigEndian>(*parent);
                let _ = payload.write_u64::<BigEndian>(*child);
                write_digest(&mut payload, info_digest);
            }
            LogRecord::EdgeRemoved {
                relation,
                parent,
                child,
            } => {
                payload.push(TAG_EDGE_REMOVED);
                payload.push(*relation);
                let _ = payload.write_u64::<BigEndian>(*parent);
                let _ = payload.write_u64::<BigEndian>(*child);
            }
            LogRecord::Exception {
                matcher_digest,
                failure_point,
                status,
            } => {
                payload.push(TAG_EXCEPTION);
                write_digest(&mut payload, matcher_digest);
                let _ = payload.write_u64::<BigEndian>(*failure_point);
                payload.push(*status);
            }
            LogRecord::TaskEventBound {
                task,
                symbol,
                generator,
            } => {
                payload.push(TAG_TASK_EVENT_BOUND);
                let _ = payload.write_u64::<BigEndian>(*task);
                let bytes = symbol.as_bytes();
                let _ = payload.write_u16::<BigEndian>(bytes.len() as u16);
                let _ = payload.write_all(bytes);
                let _ = payload.write_u64::<BigEndian>(*generator);
            }
        }
        let mut frame = Vec::with_capacity(payload.len() + 4);
        let _ = frame.write_u32::<BigEndian>(payload.len() as u32);
        frame.extend_from_slice(&payload);
        frame
    }

    /// Decode one frame payload (tag included, length prefix stripped).
    /// `Ok(None)` for tags added by newer format versions.
    pub fn from_payload(payload: &[u8]) -> Result<Option<LogRecord>, PlanError> {
        if payload.is_empty() {
            return Err(PlanError::InvalidLogRecord("empty frame".to_string()));
        }
        let tag = payload[0];
        let mut cursor = Cursor::new(&payload[1..]);
        let record = match tag {
            TAG_CYCLE_START => LogRecord::CycleStart {
                cycle: cursor.read_u64::<BigEndian>()?,
                time: read_time(&mut cursor)?,
            },
            TAG_CYCLE_END => LogRecord::CycleEnd {
                cycle: cursor.read_u64::<BigEndian>()?,
                time: read_time(&mut cursor)?,
                stats: CycleStats {
                    duration_us: cursor.read_u64::<BigEndian>()?,
                    emissions: cursor.read_u32::<BigEndian>()?,
                    errors: cursor.read_u32::<BigEndian>()?,
                },
            },
            TAG_TASK_ADDED => LogRecord::TaskAdded {
                task: cursor.read_u64::<BigEndian>()?,
                model_digest: read_digest(&mut cursor)?,
                arguments_digest: read_digest(&mut cursor)?,
                time: read_time(&mut cursor)?,
            },
            TAG_TASK_FINALIZED => LogRecord::TaskFinalized {
                task: cursor.read_u64::<BigEndian>()?,
                time: read_time(&mut cursor)?,
            },
            TAG_EVENT_EMITTED => {
                let generator = cursor.read_u64::<BigEndian>()?;
                let context_digest = read_digest(&mut cursor)?;
                let count = cursor.read_u32::<BigEndian>()?;
                let mut sources = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let source = cursor.read_u64::<BigEndian>()?;
                    let index = cursor.read_u32::<BigEndian>()?;
                    sources.push((source, index));
                }
                LogRecord::EventEmitted {
                    generator,
                    context_digest,
                    sources,
                    time: read_time(&mut cursor)?,
                }
            }
            TAG_EVENT_UNREACHABLE => LogRecord::EventUnreachable {
                generator: cursor.read_u64::<BigEndian>()?,
                reason_digest: read_digest(&mut cursor)?,
                time: read_time(&mut cursor)?,
            },
            TAG_EDGE_ADDED => LogRecord::EdgeAdded {
                relation: cursor.read_u8()?,
                parent: cursor.read_u64::<BigEndian>()?,
                child: cursor.read_u64::<BigEndian>()?,
                info_digest: read_digest(&mut cursor)?,
            },
            TAG_EDGE_REMOVED => LogRecord::EdgeRemoved {
                relation: cursor.read_u8()?,
                parent: cursor.read_u64::<BigEndian>()?,
                child: cursor.read_u64::<BigEndian>()?,
            },
            TAG_EXCEPTION => LogRecord::Exception {
                matcher_digest: read_digest(&mut cursor)?,
                failure_point: cursor.read_u64::<BigEndian>()?,
                status: cursor.read_u8()?,
            },
            TAG_TASK_EVENT_BOUND => {
                let task = cursor.read_u64::<BigEndian>()?;
                let length = cursor.read_u16::<BigEndian>()? as usize;
                let bytes = read_bytes(&mut cursor, length)?;
                let symbol = String::from_utf8(bytes)
                    .map_err(|e| PlanError::ConversionError(e.to_string()))?;
                LogRecord::TaskEventBound {
                    task,
                    symbol,
                    generator: cursor.read_u64::<BigEndian>()?,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(record))
    }

    /// Read the next frame off a stream. `Ok(None)` at a clean end of file.
    pub fn read_frame(reader: &mut impl Read) -> Result<Option<Vec<u8>>, PlanError> {
        let mut length = [0u8; 4];
        match reader.read_exact(&mut length) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let length = u32::from_be_bytes(length) as usize;
        Ok(Some(read_bytes(reader, length)?))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{CycleStats, LogRecord};
    use crate::ident::Digest;

    fn records() -> Vec<LogRecord> {
        let time = Utc.timestamp_micros(1_700_000_000_000_000).single().unwrap();
        vec![
            LogRecord::CycleStart { cycle: 7, time },
            LogRecord::CycleEnd {
                cycle: 7,
                time,
                stats: CycleStats {
                    duration_us: 1500,
                    emissions: 3,
                    errors: 1,
                },
            },
            LogRecord::TaskAdded {
                task: 11,
                model_digest: Digest::of_bytes(b"model"),
                arguments_digest: Digest::of_bytes(b"args"),
                time,
            },
            LogRecord::TaskFinalized { task: 11, time },
            LogRecord::EventEmitted {
                generator: 21,
                context_digest: Digest::zero(),
                sources: vec![(20, 0), (19, 2)],
                time,
            },
            LogRecord::EventUnreachable {
                generator: 22,
                reason_digest: Digest::of_bytes(b"reason"),
                time,
            },
            LogRecord::EdgeAdded {
                relation: 0,
                parent: 11,
                child: 12,
                info_digest: Digest::zero(),
            },
            LogRecord::EdgeRemoved {
                relation: 0,
                parent: 11,
                child: 12,
            },
            LogRecord::Exception {
                matcher_digest: Digest::of_bytes(b"matcher"),
                failure_point: 12,
                status: 2,
            },
            LogRecord::TaskEventBound {
                task: 11,
                symbol: "start".to_string(),
                generator: 21,
            },
        ]
    }

    /// Every record kind round-trips through its frame.
    #[test]
    fn test_frame_round_trip() {
        for record in records() {
            let frame = record.to_frame();
            let mut reader = std::io::Cursor::new(frame);
            let payload = LogRecord::read_frame(&mut reader).unwrap().unwrap();
            let decoded = LogRecord::from_payload(&payload).unwrap().unwrap();
            assert_eq!(decoded, record);
        }
    }

    /// Unknown tags are skipped, not errors: additive compatibility.
    #[test]
    fn test_unknown_tag_is_skipped() {
        let payload = vec![200u8, 1, 2, 3];
        assert!(LogRecord::from_payload(&payload).unwrap().is_none());
    }

    /// A truncated payload is a decode error, not a panic.
    #[test]
    fn test_truncated_payload() {
        let record = LogRecord::TaskFinalized {
            task: 3,
            time: Utc::now(),
        };
        let frame = record.to_frame();
        let payload = &frame[4..frame.len() - 2];
        assert!(LogRecord::from_payload(payload).is_err());
    }
}
