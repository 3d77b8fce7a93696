//! Write-ahead journal backing the delivery queue.
//!
//! `<data_dir>/delivery/journal.jsonl` holds one JSON record per line:
//!
//! ```text
//! {"op":"enqueued","job":{...}}
//! {"op":"attempt","id":"...","attempt":1}
//! {"op":"finished","id":"..."}
//! ```
//!
//! A single writer task owns the file. Appends queued while it is busy are
//! written as one batch followed by one `fsync`; each caller is acked only
//! after that sync. The writer also tracks which jobs are still unfinished and
//! rewrites the file to just those once enough jobs have finished.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::DeliveryJob;
use crate::error::QueueError;

const JOURNAL_FILE: &str = "journal.jsonl";

/// Upper bound on appends folded into one sync.
const MAX_BATCH: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalRecord {
    Enqueued { job: DeliveryJob },
    /// Written before attempt number `attempt` starts.
    Attempt { id: Uuid, attempt: u32 },
    Finished { id: Uuid },
}

struct Append {
    record: JournalRecord,
    line: String,
    ack: oneshot::Sender<io::Result<()>>,
}

/// Handle to the journal writer task. Cloning shares the same writer.
#[derive(Clone)]
pub struct Journal {
    tx: mpsc::Sender<Append>,
}

/// Unfinished jobs as of the last durable record.
#[derive(Default)]
struct LiveJobs {
    jobs: HashMap<Uuid, DeliveryJob>,
    finished_since_compact: usize,
}

impl LiveJobs {
    fn apply(&mut self, record: &JournalRecord) {
        match record {
            JournalRecord::Enqueued { job } => {
                self.jobs.insert(job.id, job.clone());
            }
            JournalRecord::Attempt { id, attempt } => {
                if let Some(job) = self.jobs.get_mut(id) {
                    job.attempts = job.attempts.max(*attempt);
                }
            }
            JournalRecord::Finished { id } => {
                if self.jobs.remove(id).is_some() {
                    self.finished_since_compact += 1;
                }
            }
        }
    }
}

impl Journal {
    /// Open (or create) the journal in `dir`, replay it, and spawn the writer.
    ///
    /// Returns the jobs that were accepted but never finished, each with the
    /// number of attempts already started. The file is compacted to exactly
    /// those jobs before the writer takes over.
    pub async fn open(
        dir: &Path,
        compact_threshold: usize,
    ) -> Result<(Self, Vec<DeliveryJob>), QueueError> {
        fs::create_dir_all(dir).await?;
        let path = dir.join(JOURNAL_FILE);

        let mut live = replay(&path).await?;
        let file = compact(&path, &live).await?;
        live.finished_since_compact = 0;

        let mut pending: Vec<DeliveryJob> = live.jobs.values().cloned().collect();
        pending.sort_by_key(|job| job.created_at);
        if !pending.is_empty() {
            info!(count = pending.len(), path = %path.display(), "Recovered unfinished delivery jobs");
        }

        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer_task(path, file, rx, live, compact_threshold.max(1)));
        Ok((Self { tx }, pending))
    }

    /// Append one record and wait until it is synced to disk.
    pub async fn append(&self, record: JournalRecord) -> Result<(), QueueError> {
        let line = serde_json::to_string(&record)?;
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Append { record, line, ack })
            .await
            .map_err(|_| QueueError::Closed)?;
        done.await.map_err(|_| QueueError::Closed)??;
        Ok(())
    }
}

/// Rebuild the unfinished-job set from an existing journal file.
async fn replay(path: &Path) -> Result<LiveJobs, QueueError> {
    let mut live = LiveJobs::default();
    let file = match fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(live),
        Err(e) => return Err(e.into()),
    };

    let mut lines = BufReader::new(file).lines();
    let mut skipped = 0usize;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalRecord>(&line) {
            Ok(record) => live.apply(&record),
            Err(e) => {
                // A torn final line after a crash is expected; anything
                // before it is still usable.
                warn!("Skipping corrupt delivery journal line: {e}");
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        warn!(skipped, path = %path.display(), "Delivery journal had unreadable records");
    }
    Ok(live)
}

/// Atomically rewrite the journal to contain only the live jobs, then reopen
/// it for appending.
async fn compact(path: &Path, live: &LiveJobs) -> Result<fs::File, io::Error> {
    let tmp = tmp_path(path);
    {
        let mut out = fs::File::create(&tmp).await?;
        for job in live.jobs.values() {
            let record = JournalRecord::Enqueued { job: job.clone() };
            let line = serde_json::to_string(&record).map_err(io::Error::other)?;
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
        }
        out.flush().await?;
        out.sync_all().await?;
    }
    fs::rename(&tmp, path).await?;
    debug!(live = live.jobs.len(), path = %path.display(), "Compacted delivery journal");
    fs::OpenOptions::new().append(true).open(path).await
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Background task that owns the journal file.
async fn writer_task(
    path: PathBuf,
    mut file: fs::File,
    mut rx: mpsc::Receiver<Append>,
    mut live: LiveJobs,
    compact_threshold: usize,
) {
    // Set when a failed batch could not be cut back off the file. The next
    // batch rewrites the journal from the live set before appending.
    let mut torn = false;
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        // Batch: drain everything already queued before syncing
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(next) => batch.push(next),
                Err(_) => break,
            }
        }

        if torn {
            match compact(&path, &live).await {
                Ok(f) => {
                    file = f;
                    live.finished_since_compact = 0;
                    torn = false;
                    info!(path = %path.display(), "Repaired delivery journal");
                }
                Err(e) => error!("Delivery journal repair failed: {e}"),
            }
        }

        let result = if torn {
            Err(io::Error::other("delivery journal has an unrepaired partial write"))
        } else {
            write_batch(&mut file, &batch, &mut torn).await
        };
        if let Err(e) = &result {
            error!("Delivery journal write error: {e}");
        }
        for append in batch {
            let ack = match &result {
                Ok(()) => {
                    live.apply(&append.record);
                    Ok(())
                }
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = append.ack.send(ack);
        }

        if live.finished_since_compact >= compact_threshold {
            match compact(&path, &live).await {
                Ok(f) => {
                    file = f;
                    live.finished_since_compact = 0;
                    torn = false;
                }
                Err(e) => error!("Delivery journal compaction failed: {e}"),
            }
        }
    }
    debug!("Delivery journal writer stopped");
}

/// Append and sync one batch. On failure the file is cut back to its length
/// before the batch, so a partial line never merges with the next record;
/// `torn` is set if that cut fails too.
async fn write_batch(file: &mut fs::File, batch: &[Append], torn: &mut bool) -> io::Result<()> {
    let start = file.metadata().await?.len();
    let lines: Vec<&str> = batch.iter().map(|a| a.line.as_str()).collect();
    let result = append_lines(file, lines).await;
    if result.is_err() {
        if let Err(e) = rewind(file, start).await {
            error!("Failed to drop partial delivery journal write: {e}");
            *torn = true;
        }
    }
    result
}

async fn append_lines<'a>(
    file: &mut fs::File,
    lines: impl IntoIterator<Item = &'a str>,
) -> io::Result<()> {
    for line in lines {
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
    }
    file.flush().await?;
    file.sync_data().await
}

/// Drop everything past `len`.
async fn rewind(file: &mut fs::File, len: u64) -> io::Result<()> {
    file.set_len(len).await?;
    file.sync_data().await
}
