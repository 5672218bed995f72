use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::task::RecordError;

/// A non-fatal error observed during a run. Each one is reported once.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Parse(#[from] RecordError),

    #[error("sql err: host {host} on worker {worker}: {source:#}")]
    Query {
        host: String,
        worker: usize,
        source: anyhow::Error,
    },
}

/// Receiving end of the error stream is owned by whoever renders errors.
pub type ErrorSink = mpsc::UnboundedSender<RunError>;

pub fn error_stream() -> (ErrorSink, mpsc::UnboundedReceiver<RunError>) {
    mpsc::unbounded_channel()
}

/// Deliver `err` to the sink, logging it instead if the sink is gone.
pub(crate) fn report(sink: &ErrorSink, err: RunError) {
    if let Err(mpsc::error::SendError(err)) = sink.send(err) {
        warn!(error = %err, "error stream closed");
    }
}
