//! Worker error taxonomy
//!
//! Worker code returns [`WorkerResult`] so the run loop can tell apart the three
//! ways a phase can end early:
//!
//! - [`WorkerError::Interrupted`]: cooperative cancellation, not a failure
//! - [`WorkerError::Phase`]: the current phase failed for this worker, the
//!   worker reports done-with-error and waits for the next phase
//! - [`WorkerError::Setup`]: the worker can't run at all and leaves its thread

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker interrupted")]
    Interrupted,

    #[error("{0}")]
    Phase(String),

    #[error("{0}")]
    Setup(String),
}

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

impl WorkerError {
    /// Classify `err` as a phase error, keeping interruptions intact
    pub fn phase(err: anyhow::Error) -> Self {
        match err.downcast::<WorkerError>() {
            Ok(worker_err) => worker_err,
            Err(err) => WorkerError::Phase(format!("{:#}", err)),
        }
    }

    /// Classify `err` as a setup error, keeping interruptions intact
    pub fn setup(err: anyhow::Error) -> Self {
        match err.downcast::<WorkerError>() {
            Ok(WorkerError::Phase(msg)) => WorkerError::Setup(msg),
            Ok(worker_err) => worker_err,
            Err(err) => WorkerError::Setup(format!("{:#}", err)),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, WorkerError::Interrupted)
    }
}

/// Conversion of fallible results into the worker taxonomy
pub trait WorkerResultExt<T> {
    fn phase_err(self) -> WorkerResult<T>;
    fn setup_err(self) -> WorkerResult<T>;
}

impl<T, E> WorkerResultExt<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn phase_err(self) -> WorkerResult<T> {
        self.map_err(|e| WorkerError::phase(e.into()))
    }

    fn setup_err(self) -> WorkerResult<T> {
        self.map_err(|e| WorkerError::setup(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::GpuError;
    use anyhow::Context;

    #[test]
    fn test_phase_keeps_context_chain() {
        let err: anyhow::Result<()> = Err(std::io::Error::from_raw_os_error(libc::ENOENT))
            .context("File open failed. Path: /x/r0/d0/f0");

        let err = err.phase_err().unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("File open failed"));
        assert!(msg.contains("No such file"));
        assert!(matches!(err, WorkerError::Phase(_)));
    }

    #[test]
    fn test_interruption_survives_classification() {
        let err = anyhow::Error::new(WorkerError::Interrupted);
        assert!(WorkerError::phase(err).is_interrupted());

        let err = anyhow::Error::new(WorkerError::Interrupted);
        assert!(WorkerError::setup(err).is_interrupted());
    }

    #[test]
    fn test_gpu_error_becomes_setup_error() {
        let res: std::result::Result<(), GpuError> = Err(GpuError::NotAvailable);
        let err = res.setup_err().unwrap_err();
        assert!(matches!(err, WorkerError::Setup(ref msg) if msg.contains("without GPU support")));
    }
}
