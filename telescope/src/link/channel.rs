//! Link fed by tokio I/O tasks

use super::Link;
use crate::error::LinkError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::task::JoinHandle;

/// Received chunks buffered between the I/O task and the update thread
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;
/// Outgoing chunks waiting for the writer
pub(crate) const OUTGOING_CHANNEL_CAPACITY: usize = 16;

const READ_CHUNK: usize = 4096;

/// What an I/O task reports
#[derive(Debug)]
pub(crate) enum LinkEvent {
    Connected,
    Data(Vec<u8>),
    Closed,
    Failed(LinkError),
}

/// Non-blocking view of a stream owned by background tasks.
///
/// Dropping the link aborts its tasks, which closes the socket or kills the
/// driver process.
#[derive(Debug)]
pub struct ChannelLink {
    label: String,
    events: mpsc::Receiver<LinkEvent>,
    outgoing: mpsc::Sender<Vec<u8>>,
    /// Received bytes not yet handed out
    carry: Vec<u8>,
    established: bool,
    closed: Option<LinkError>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChannelLink {
    pub(crate) fn new(
        label: String,
        events: mpsc::Receiver<LinkEvent>,
        outgoing: mpsc::Sender<Vec<u8>>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            label,
            events,
            outgoing,
            carry: Vec::new(),
            established: false,
            closed: None,
            tasks,
        }
    }

    /// Pull task events until `want` bytes are buffered or none are left
    fn pump_events(&mut self, want: usize) {
        while self.closed.is_none() && self.carry.len() < want.max(1) {
            match self.events.try_recv() {
                Ok(LinkEvent::Connected) => self.established = true,
                Ok(LinkEvent::Data(chunk)) => self.carry.extend_from_slice(&chunk),
                Ok(LinkEvent::Closed) => self.closed = Some(LinkError::Closed),
                Ok(LinkEvent::Failed(err)) => self.closed = Some(err),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.closed = Some(LinkError::Closed),
            }
        }
    }
}

impl Drop for ChannelLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Link for ChannelLink {
    fn poll_established(&mut self) -> Result<bool, LinkError> {
        if !self.established {
            self.pump_events(0);
        }
        match (&self.closed, self.established) {
            (_, true) => Ok(true),
            (Some(err), false) => Err(err.clone()),
            (None, false) => Ok(false),
        }
    }

    fn read_available(&mut self, buf: &mut Vec<u8>, limit: usize) -> Result<usize, LinkError> {
        self.pump_events(limit);
        let n = self.carry.len().min(limit);
        if n == 0 {
            if let Some(err) = &self.closed {
                return Err(err.clone());
            }
            return Ok(0);
        }
        buf.extend(self.carry.drain(..n));
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, LinkError> {
        if let Some(err) = &self.closed {
            return Err(err.clone());
        }
        if !self.established || data.is_empty() {
            return Ok(0);
        }
        match self.outgoing.try_send(data.to_vec()) {
            Ok(()) => Ok(data.len()),
            Err(TrySendError::Full(_)) => Ok(0),
            Err(TrySendError::Closed(_)) => Err(LinkError::Closed),
        }
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Move bytes between a stream and the link channels until either side ends
pub(crate) async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    events: mpsc::Sender<LinkEvent>,
    mut outgoing: mpsc::Receiver<Vec<u8>>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let read_loop = async {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), std::io::Error>(());
            }
            if events.send(LinkEvent::Data(buf[..n].to_vec())).await.is_err() {
                return Ok(());
            }
        }
    };

    let write_loop = async {
        while let Some(chunk) = outgoing.recv().await {
            writer.write_all(&chunk).await?;
            writer.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    };

    let result = tokio::select! {
        result = read_loop => result,
        result = write_loop => result,
    };

    let event = match result {
        Ok(()) => LinkEvent::Closed,
        Err(e) => {
            tracing::debug!("Link I/O error: {}", e);
            LinkEvent::Failed(e.into())
        }
    };
    let _ = events.send(event).await;
}
