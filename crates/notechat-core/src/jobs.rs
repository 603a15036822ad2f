//! Background ingestion
//!
//! [`IngestWorker`] owns an [`Ingestor`] on a dedicated thread. Jobs arrive
//! through a `crossbeam-channel` queue and run one at a time, so a single
//! worker is the only writer for its storage target. Each finished job is
//! reported on the completion channel.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crate::config::IngestMode;
use crate::document::DocNode;
use crate::error::{RagError, Result};
use crate::pipeline::{IngestReport, Ingestor};

/// What to ingest
#[derive(Debug, Clone)]
pub enum IngestSource {
    File(PathBuf),
    Document { root: DocNode, source_file: String },
}

impl IngestSource {
    fn label(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Document { source_file, .. } => source_file.clone(),
        }
    }
}

#[derive(Debug)]
struct IngestJob {
    id: u64,
    source: IngestSource,
    mode: Option<IngestMode>,
}

/// Outcome of one queued job
#[derive(Debug)]
pub struct IngestCompletion {
    pub job_id: u64,
    pub source: String,
    pub result: Result<IngestReport>,
}

pub struct IngestWorker {
    jobs: Option<Sender<IngestJob>>,
    completions: Receiver<IngestCompletion>,
    handle: Option<JoinHandle<()>>,
    next_id: AtomicU64,
}

impl IngestWorker {
    pub fn spawn(mut ingestor: Ingestor) -> Self {
        let (job_tx, job_rx) = unbounded::<IngestJob>();
        let (done_tx, done_rx) = unbounded();

        let handle = thread::spawn(move || {
            for job in job_rx {
                let label = job.source.label();
                tracing::info!("Ingest job {} started: {}", job.id, label);

                let default_mode = ingestor.mode();
                if let Some(mode) = job.mode {
                    ingestor.set_mode(mode);
                }
                let result = match &job.source {
                    IngestSource::File(path) => ingestor.ingest_file(path),
                    IngestSource::Document { root, source_file } => {
                        ingestor.ingest_document(root, source_file)
                    }
                };
                ingestor.set_mode(default_mode);

                if let Err(e) = &result {
                    tracing::warn!("Ingest job {} failed: {}", job.id, e);
                }
                let completion = IngestCompletion {
                    job_id: job.id,
                    source: label,
                    result,
                };
                if done_tx.send(completion).is_err() {
                    tracing::debug!("Completion receiver dropped; stopping ingest worker");
                    break;
                }
            }
        });

        Self {
            jobs: Some(job_tx),
            completions: done_rx,
            handle: Some(handle),
            next_id: AtomicU64::new(1),
        }
    }

    /// Queue a job, returning its id
    pub fn submit(&self, source: IngestSource, mode: Option<IngestMode>) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sender = self.jobs.as_ref().ok_or_else(worker_stopped)?;
        sender
            .send(IngestJob { id, source, mode })
            .map_err(|_| worker_stopped())?;
        Ok(id)
    }

    pub fn submit_file(&self, path: impl Into<PathBuf>) -> Result<u64> {
        self.submit(IngestSource::File(path.into()), None)
    }

    pub fn completions(&self) -> &Receiver<IngestCompletion> {
        &self.completions
    }

    /// Block until the next job finishes
    pub fn recv(&self) -> Option<IngestCompletion> {
        self.completions.recv().ok()
    }

    /// Stop accepting jobs, finish the queue, and return the remaining completions
    pub fn shutdown(mut self) -> Vec<IngestCompletion> {
        self.stop();
        self.completions.try_iter().collect()
    }

    fn stop(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Ingest worker thread panicked");
            }
        }
    }
}

impl Drop for IngestWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_stopped() -> RagError {
    RagError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "ingest worker has stopped",
    ))
}
