use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use super::output::ListenedVariable;
use super::record::JobRecord;
use crate::value::Raster;

/// Failure of an output collaborator. Never fatal to the simulation.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("i/o failure on `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode output: {0}")]
    Encode(String),
    #[error("sink already closed")]
    Closed,
}

/// Receives the samples of a job, one batch per step.
pub trait OutputSink {
    fn write_header(&mut self, job: &JobRecord) -> Result<(), SinkError>;

    fn write_step(&mut self, step: u64, outputs: &[ListenedVariable]) -> Result<(), SinkError>;

    fn close(&mut self) -> Result<(), SinkError>;
}

/// Stores display rasters and reports where they went.
pub trait ImageWriter {
    fn write_image(&mut self, path: &Path, raster: &Raster) -> Result<(), SinkError>;
}

/// Everything a [`MemorySink`] has received.
#[derive(Debug, Clone, Default)]
pub struct SinkLog {
    pub header: Option<JobRecord>,
    pub steps: Vec<(u64, Vec<ListenedVariable>)>,
    pub closed: usize,
}

/// Sink keeping every batch in memory; clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    log: Arc<Mutex<SinkLog>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of what has been written so far.
    #[must_use]
    pub fn log(&self) -> SinkLog {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut SinkLog) -> T) -> T {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut log)
    }
}

impl OutputSink for MemorySink {
    fn write_header(&mut self, job: &JobRecord) -> Result<(), SinkError> {
        self.with_log(|log| log.header = Some(job.clone()));
        Ok(())
    }

    fn write_step(&mut self, step: u64, outputs: &[ListenedVariable]) -> Result<(), SinkError> {
        self.with_log(|log| {
            if log.closed > 0 {
                return Err(SinkError::Closed);
            }
            log.steps.push((step, outputs.to_vec()));
            Ok(())
        })
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.with_log(|log| log.closed += 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_one_log() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.write_step(0, &[]).unwrap();
        writer.close().unwrap();
        assert!(matches!(writer.write_step(1, &[]), Err(SinkError::Closed)));
        let log = sink.log();
        assert_eq!(log.steps.len(), 1);
        assert_eq!(log.closed, 1);
    }
}
