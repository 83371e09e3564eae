use crate::DiagnosticReport;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Dispatcher hands a DiagnosticReport to a collector.
///
/// `send` is called from within the request path and must not block on I/O.
/// Implementations which transmit over a network should enqueue and return.
/// Errors (and panics) are logged by the Engine and otherwise ignored:
/// a report is attempted exactly once and is never retried.
pub trait Dispatcher: Send + Sync + 'static {
    fn send(&self, report: DiagnosticReport) -> anyhow::Result<()>;
}

impl<F> Dispatcher for F
where
    F: Fn(DiagnosticReport) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn send(&self, report: DiagnosticReport) -> anyhow::Result<()> {
        self(report)
    }
}

/// ChannelDispatcher enqueues reports into a bounded channel,
/// from which a separate task forwards them to a collector.
/// A report which doesn't fit into the channel is dropped with an error.
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<DiagnosticReport>,
}

impl ChannelDispatcher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DiagnosticReport>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl Dispatcher for ChannelDispatcher {
    fn send(&self, report: DiagnosticReport) -> anyhow::Result<()> {
        match self.tx.try_send(report) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(report)) => {
                anyhow::bail!(
                    "report queue is full, dropping report {}",
                    report.request_id
                )
            }
            Err(mpsc::error::TrySendError::Closed(report)) => {
                anyhow::bail!(
                    "report queue is closed, dropping report {}",
                    report.request_id
                )
            }
        }
    }
}

/// JsonWriteDispatcher writes each report as a single line of JSON.
pub struct JsonWriteDispatcher<W> {
    writer: Arc<Mutex<W>>,
}

impl<W> JsonWriteDispatcher<W>
where
    W: std::io::Write + Send + 'static,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }
}

impl<W> Dispatcher for JsonWriteDispatcher<W>
where
    W: std::io::Write + Send + 'static,
{
    fn send(&self, report: DiagnosticReport) -> anyhow::Result<()> {
        let mut buf = serde_json::to_vec(&report)?;
        buf.push(b'\n');

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(&buf)?;
        writer.flush()?;
        Ok(())
    }
}
