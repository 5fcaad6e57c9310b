//! The durable store-and-forward queue.
//!
//! Each partition is an append-only log of records
//! plus a committed-offset file.
//! A record is durable once appended and fsynced;
//! delivery is acknowledged by advancing
//! (and fsyncing) the committed offset.
//! Records which exhaust their attempt budget
//! move to the dead-letter partition.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteordered::byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use snafu::{ensure, ResultExt, Snafu};
use tracing::{debug, info, warn};

use crate::coordinator::StorageClient;
use crate::error::Error as StoreError;

const LOG_FILE: &str = "queue.log";
const DEAD_LETTER_FILE: &str = "dead-letter.log";
const COMMITTED_FILE: &str = "committed";

/// Magic marker at the start of every record.
const RECORD_MAGIC: u32 = 0x5146_4451; // "QDFQ"

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not open queue partition at {}", path.display()))]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    /// could not append a record to the log
    Append { source: std::io::Error },

    /// could not read a record from the log
    ReadRecord { source: std::io::Error },

    #[snafu(display("corrupt record at offset {}", offset))]
    CorruptRecord { offset: u64 },

    /// could not persist the committed offset
    Commit { source: std::io::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One queued instance awaiting delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRecord {
    /// position of the record in its log
    pub offset: u64,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub transfer_syntax_uid: String,
    pub priority: u16,
    /// deliveries attempted so far
    pub attempts: u32,
    pub payload: Vec<u8>,
}

/// The settings of a queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// directory holding the partition files
    pub directory: PathBuf,
    /// deliveries per record before it is dead-lettered
    pub max_attempts: u32,
    /// pause between drain passes of the background worker
    pub poll_interval: Duration,
}

impl QueueConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        QueueConfig {
            directory: directory.into(),
            max_attempts: 5,
            poll_interval: Duration::from_secs(30),
        }
    }
}

struct Partition {
    log: File,
    len: u64,
}

/// A durable FIFO of instances to be stored,
/// with at-least-once delivery.
pub struct StoreQueue {
    config: QueueConfig,
    inner: Mutex<QueueInner>,
}

struct QueueInner {
    partition: Partition,
    dead_letter: Partition,
    committed_file: File,
    committed: u64,
}

impl StoreQueue {
    /// Open (or create) the queue under the configured directory.
    pub fn open(config: QueueConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.directory).context(OpenSnafu {
            path: config.directory.clone(),
        })?;

        let partition = open_partition(&config.directory.join(LOG_FILE))?;
        let dead_letter = open_partition(&config.directory.join(DEAD_LETTER_FILE))?;

        let committed_path = config.directory.join(COMMITTED_FILE);
        let mut committed_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&committed_path)
            .context(OpenSnafu {
                path: committed_path,
            })?;
        let mut buf = [0u8; 8];
        let committed = match committed_file.read_exact(&mut buf) {
            Ok(()) => u64::from_le_bytes(buf),
            Err(_) => 0,
        };

        info!(
            directory = %config.directory.display(),
            committed,
            "store-and-forward queue open"
        );

        Ok(StoreQueue {
            config,
            inner: Mutex::new(QueueInner {
                partition,
                dead_letter,
                committed_file,
                committed,
            }),
        })
    }

    /// The offset up to which delivery has been acknowledged.
    pub fn committed(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).committed
    }

    /// Number of bytes of records awaiting delivery.
    pub fn backlog(&self) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.partition.len.saturating_sub(inner.committed)
    }

    /// Append an instance to the queue.
    /// The record is durable when this returns.
    pub fn enqueue(
        &self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        transfer_syntax_uid: &str,
        priority: u16,
        payload: &[u8],
    ) -> Result<u64> {
        let record = QueueRecord {
            offset: 0,
            sop_class_uid: sop_class_uid.to_string(),
            sop_instance_uid: sop_instance_uid.to_string(),
            transfer_syntax_uid: transfer_syntax_uid.to_string(),
            priority,
            attempts: 0,
            payload: payload.to_vec(),
        };
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let offset = append_record(&mut inner.partition, &record)?;
        debug!(
            offset,
            sop_instance_uid, "instance enqueued for store-and-forward"
        );
        Ok(offset)
    }

    /// Read the first record past the committed offset, if any.
    pub fn peek(&self) -> Result<Option<QueueRecord>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let offset = inner.committed;
        read_record_at(&mut inner.partition, offset)
    }

    /// Acknowledge delivery of the record at the given offset,
    /// advancing the committed offset past it.
    pub fn commit(&self, record: &QueueRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let next = record.offset + encoded_len(record);
        inner.committed = next;
        inner
            .committed_file
            .seek(SeekFrom::Start(0))
            .context(CommitSnafu)?;
        inner
            .committed_file
            .write_all(&next.to_le_bytes())
            .context(CommitSnafu)?;
        inner.committed_file.sync_all().context(CommitSnafu)?;
        Ok(())
    }

    /// Put a failed record back at the end of the queue
    /// with an incremented attempt counter,
    /// or into the dead-letter partition
    /// once the attempt budget is spent.
    /// The original position is committed either way.
    pub fn retry_later(&self, record: &QueueRecord) -> Result<()> {
        let mut requeued = record.clone();
        requeued.attempts += 1;

        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if requeued.attempts >= self.config.max_attempts {
                warn!(
                    sop_instance_uid = %requeued.sop_instance_uid,
                    attempts = requeued.attempts,
                    "record exhausted its attempts, dead-lettering"
                );
                append_record(&mut inner.dead_letter, &requeued)?;
            } else {
                append_record(&mut inner.partition, &requeued)?;
            }
        }
        self.commit(record)
    }

    /// Deliver queued records through the given client
    /// until the queue is empty or a delivery fails
    /// with a non-retryable coordinator error.
    ///
    /// Returns the number of records delivered.
    pub async fn drain(&self, client: &StorageClient) -> Result<usize> {
        let mut delivered = 0usize;
        loop {
            let Some(record) = self.peek()? else {
                return Ok(delivered);
            };

            match client.store(record.payload.clone()).await {
                Ok(report) => {
                    debug!(
                        offset = record.offset,
                        server = report.server,
                        "queued instance delivered"
                    );
                    self.commit(&record)?;
                    delivered += 1;
                }
                Err(error) => {
                    warn!(
                        offset = record.offset,
                        error = %error,
                        "queued instance delivery failed"
                    );
                    self.retry_later(&record)?;
                    if !error.retryable() {
                        continue;
                    }
                    // transient trouble: let the caller back off
                    return Ok(delivered);
                }
            }
        }
    }
}

/// Spawn the background worker which drains the queue
/// on the configured interval.
pub fn spawn_worker(
    queue: Arc<StoreQueue>,
    client: Arc<StorageClient>,
) -> tokio::task::JoinHandle<()> {
    let interval = queue.config.poll_interval;
    tokio::spawn(async move {
        loop {
            match queue.drain(&client).await {
                Ok(0) => {}
                Ok(delivered) => info!(delivered, "store-and-forward pass complete"),
                Err(error) => warn!(error = %error, "store-and-forward pass failed"),
            }
            tokio::time::sleep(interval).await;
        }
    })
}

/// Convert a delivery error into the taxonomy error for callers.
impl From<Error> for StoreError {
    fn from(error: Error) -> Self {
        StoreError::InvalidState {
            message: error.to_string(),
        }
    }
}

fn open_partition(path: &Path) -> Result<Partition> {
    let log = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .context(OpenSnafu { path })?;
    let len = log.metadata().context(OpenSnafu { path })?.len();
    Ok(Partition { log, len })
}

fn encoded_len(record: &QueueRecord) -> u64 {
    // magic + string lengths + priority + attempts + payload length
    (4 + 2 + 2 + 2 + 2 + 4 + 4
        + record.sop_class_uid.len()
        + record.sop_instance_uid.len()
        + record.transfer_syntax_uid.len()
        + record.payload.len()) as u64
}

fn append_record(partition: &mut Partition, record: &QueueRecord) -> Result<u64> {
    let offset = partition.len;

    let mut buf = Vec::with_capacity(encoded_len(record) as usize);
    buf.write_u32::<LittleEndian>(RECORD_MAGIC).context(AppendSnafu)?;
    buf.write_u16::<LittleEndian>(record.sop_class_uid.len() as u16)
        .context(AppendSnafu)?;
    buf.write_u16::<LittleEndian>(record.sop_instance_uid.len() as u16)
        .context(AppendSnafu)?;
    buf.write_u16::<LittleEndian>(record.transfer_syntax_uid.len() as u16)
        .context(AppendSnafu)?;
    buf.write_u16::<LittleEndian>(record.priority)
        .context(AppendSnafu)?;
    buf.write_u32::<LittleEndian>(record.attempts)
        .context(AppendSnafu)?;
    buf.write_u32::<LittleEndian>(record.payload.len() as u32)
        .context(AppendSnafu)?;
    buf.extend_from_slice(record.sop_class_uid.as_bytes());
    buf.extend_from_slice(record.sop_instance_uid.as_bytes());
    buf.extend_from_slice(record.transfer_syntax_uid.as_bytes());
    buf.extend_from_slice(&record.payload);

    partition.log.write_all(&buf).context(AppendSnafu)?;
    // durable once the log is flushed to disk
    partition.log.sync_all().context(AppendSnafu)?;
    partition.len += buf.len() as u64;
    Ok(offset)
}

fn read_record_at(partition: &mut Partition, offset: u64) -> Result<Option<QueueRecord>> {
    if offset >= partition.len {
        return Ok(None);
    }
    partition
        .log
        .seek(SeekFrom::Start(offset))
        .context(ReadRecordSnafu)?;

    let magic = partition
        .log
        .read_u32::<LittleEndian>()
        .context(ReadRecordSnafu)?;
    ensure!(magic == RECORD_MAGIC, CorruptRecordSnafu { offset });

    let sop_class_len = partition
        .log
        .read_u16::<LittleEndian>()
        .context(ReadRecordSnafu)? as usize;
    let sop_instance_len = partition
        .log
        .read_u16::<LittleEndian>()
        .context(ReadRecordSnafu)? as usize;
    let transfer_syntax_len = partition
        .log
        .read_u16::<LittleEndian>()
        .context(ReadRecordSnafu)? as usize;
    let priority = partition
        .log
        .read_u16::<LittleEndian>()
        .context(ReadRecordSnafu)?;
    let attempts = partition
        .log
        .read_u32::<LittleEndian>()
        .context(ReadRecordSnafu)?;
    let payload_len = partition
        .log
        .read_u32::<LittleEndian>()
        .context(ReadRecordSnafu)? as usize;

    let mut strings = vec![0u8; sop_class_len + sop_instance_len + transfer_syntax_len];
    partition
        .log
        .read_exact(&mut strings)
        .context(ReadRecordSnafu)?;
    let mut payload = vec![0u8; payload_len];
    partition
        .log
        .read_exact(&mut payload)
        .context(ReadRecordSnafu)?;

    let text = |range: std::ops::Range<usize>| -> Result<String> {
        String::from_utf8(strings[range].to_vec())
            .map_err(|_| Error::CorruptRecord { offset })
    };

    Ok(Some(QueueRecord {
        offset,
        sop_class_uid: text(0..sop_class_len)?,
        sop_instance_uid: text(sop_class_len..sop_class_len + sop_instance_len)?,
        transfer_syntax_uid: text(
            sop_class_len + sop_instance_len
                ..sop_class_len + sop_instance_len + transfer_syntax_len,
        )?,
        priority,
        attempts,
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_in_temp_dir(max_attempts: u32) -> (StoreQueue, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = QueueConfig::new(dir.path());
        config.max_attempts = max_attempts;
        (StoreQueue::open(config).unwrap(), dir)
    }

    fn enqueue_instance(queue: &StoreQueue, uid: &str, payload: &[u8]) -> u64 {
        queue
            .enqueue(
                "1.2.840.10008.5.1.4.1.1.2",
                uid,
                "1.2.840.10008.1.2.1",
                0,
                payload,
            )
            .unwrap()
    }

    #[test]
    fn records_round_trip_in_fifo_order() {
        let (queue, _dir) = queue_in_temp_dir(5);
        enqueue_instance(&queue, "1.2.3.1", b"first payload");
        enqueue_instance(&queue, "1.2.3.2", b"second");

        let first = queue.peek().unwrap().unwrap();
        assert_eq!(first.sop_instance_uid, "1.2.3.1");
        assert_eq!(first.payload, b"first payload");
        assert_eq!(first.attempts, 0);

        queue.commit(&first).unwrap();
        let second = queue.peek().unwrap().unwrap();
        assert_eq!(second.sop_instance_uid, "1.2.3.2");

        queue.commit(&second).unwrap();
        assert!(queue.peek().unwrap().is_none());
        assert_eq!(queue.backlog(), 0);
    }

    #[test]
    fn committed_offset_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = StoreQueue::open(QueueConfig::new(dir.path())).unwrap();
            enqueue_instance(&queue, "1.2.3.1", b"payload one");
            enqueue_instance(&queue, "1.2.3.2", b"payload two");
            let first = queue.peek().unwrap().unwrap();
            queue.commit(&first).unwrap();
        }

        let queue = StoreQueue::open(QueueConfig::new(dir.path())).unwrap();
        let record = queue.peek().unwrap().unwrap();
        assert_eq!(record.sop_instance_uid, "1.2.3.2");
    }

    #[test]
    fn failed_records_requeue_with_attempt_counter() {
        let (queue, _dir) = queue_in_temp_dir(5);
        enqueue_instance(&queue, "1.2.3.1", b"payload");

        let record = queue.peek().unwrap().unwrap();
        queue.retry_later(&record).unwrap();

        let requeued = queue.peek().unwrap().unwrap();
        assert_eq!(requeued.sop_instance_uid, "1.2.3.1");
        assert_eq!(requeued.attempts, 1);
        assert!(requeued.offset > record.offset);
    }

    #[test]
    fn exhausted_records_go_to_the_dead_letter_partition() {
        let (queue, dir) = queue_in_temp_dir(2);
        enqueue_instance(&queue, "1.2.3.1", b"payload");

        let record = queue.peek().unwrap().unwrap();
        queue.retry_later(&record).unwrap();
        let record = queue.peek().unwrap().unwrap();
        assert_eq!(record.attempts, 1);
        queue.retry_later(&record).unwrap();

        // the main partition is drained,
        // the dead-letter log holds the record
        assert!(queue.peek().unwrap().is_none());
        let dead = std::fs::metadata(dir.path().join(DEAD_LETTER_FILE)).unwrap();
        assert!(dead.len() > 0);
    }
}
