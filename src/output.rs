use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, log_enabled, Level};

use crate::error::{Error, OutputError};
use crate::payload::Payload;

/// A backend client. Each instance is owned by exactly one dispatcher thread.
pub trait Outputs<P: Payload>: Send {
    fn name(&self) -> &'static str;
    fn process_payload(&mut self, payload: &P) -> Result<(), OutputError>;
}

/// Drains `receiver` into `output` until every sender is gone. Failed
/// deliveries are logged and dropped.
pub fn output_worker<P: Payload>(mut output: Box<dyn Outputs<P>>, receiver: Receiver<P>) {
    let name = output.name();
    info!("{}: started", name);
    for payload in receiver.iter() {
        if payload.is_empty() {
            continue;
        }
        if log_enabled!(Level::Debug) {
            match serde_json::to_string(&payload) {
                Ok(json) => debug!("{}: {}", name, json),
                Err(e) => debug!("{}: failed to encode payload for logging: {}", name, e),
            }
        }
        if let Err(e) = output.process_payload(&payload) {
            error!("{}: delivery of {} points failed: {}", name, payload.len(), e);
        }
    }
    info!("{}: channel closed", name);
}

/// Starts a dispatcher thread and returns the producer side of its channel.
pub fn spawn_output<P: Payload>(
    output: Box<dyn Outputs<P>>,
    capacity: usize,
) -> Result<(SyncSender<P>, JoinHandle<()>), Error> {
    let name = format!("output.{}", output.name());
    let (tx, rx) = mpsc::sync_channel(capacity);
    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || output_worker(output, rx))
        .map_err(|source| Error::Spawn { name, source })?;
    Ok((tx, handle))
}

/// Maps a failed HTTP call to an [`OutputError`].
pub(crate) fn call_error(service: &'static str, err: ureq::Error) -> OutputError {
    match err {
        ureq::Error::Status(status, response) => OutputError::Status {
            service,
            status,
            body: response.into_string().unwrap_or_default(),
        },
        other => OutputError::Transport {
            service,
            reason: other.to_string(),
        },
    }
}
