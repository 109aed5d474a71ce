//! Bidirectional message channel to a supervised process
//!
//! Reads are done by a small pump task that decodes frames into an
//! unbounded queue, so `receive()` is cancel-safe and can sit in a
//! `select!` next to the other channels without losing partial frames.

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;

use crate::common::{Error, Result};

use super::codec;

/// Outcome of a non-blocking read
#[derive(Debug, PartialEq)]
pub enum Received {
    Message(Value),
    /// The peer closed the stream; nothing more will ever arrive
    Closed,
}

/// Framed JSON channel over a reader/writer pair
pub struct Channel {
    name: String,
    writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    inbox: mpsc::UnboundedReceiver<Value>,
    /// Messages put back by a caller that was looking for something else
    backlog: VecDeque<Value>,
    pump: JoinHandle<()>,
}

impl Channel {
    /// Create a channel and start reading from `reader`
    pub fn new<R, W>(name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let name = name.into();
        let (tx, inbox) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(name.clone(), BufReader::new(reader), tx));

        Self {
            name,
            writer: Some(Box::new(writer)),
            inbox,
            backlog: VecDeque::new(),
            pump,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the write side is still open
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Serialize and write one message
    pub async fn send<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<()> {
        let value = serde_json::to_value(message)?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::ChannelClosed(self.name.clone()))?;

        tracing::trace!(channel = %self.name, ">>> {}", value);
        codec::write_message(writer, &value)
            .await
            .map_err(|e| Error::channel_write(&self.name, e))
    }

    /// Wait for the next message
    ///
    /// Returns `None` once the peer has closed the stream.
    pub async fn receive(&mut self) -> Option<Value> {
        if let Some(value) = self.backlog.pop_front() {
            return Some(value);
        }
        self.inbox.recv().await
    }

    /// Take the next message if one is already available
    pub fn try_receive(&mut self) -> Option<Received> {
        if let Some(value) = self.backlog.pop_front() {
            return Some(Received::Message(value));
        }
        match self.inbox.try_recv() {
            Ok(value) => Some(Received::Message(value)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Received::Closed),
        }
    }

    /// Put messages back in front of the queue, keeping their order
    pub fn requeue(&mut self, messages: Vec<Value>) {
        for message in messages.into_iter().rev() {
            self.backlog.push_front(message);
        }
    }

    /// Close both directions; the peer sees end-of-stream on its input
    pub fn close(&mut self) {
        tracing::debug!(channel = %self.name, "closing channel");
        self.writer = None;
        self.pump.abort();
        self.inbox.close();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump<R: AsyncBufRead + Unpin>(
    name: String,
    mut reader: R,
    tx: mpsc::UnboundedSender<Value>,
) {
    loop {
        match codec::read_message(&mut reader).await {
            Ok(Some(value)) => {
                tracing::trace!(channel = %name, "<<< {}", value);
                if tx.send(value).is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!(channel = %name, "peer closed the channel");
                break;
            }
            Err(e) => {
                tracing::error!(channel = %name, "{}", Error::channel_read(&name, e));
                break;
            }
        }
    }
}
