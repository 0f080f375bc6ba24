//! Serial link adapter.
//!
//! Drives [`SerialFrameCodec`] over any byte channel: a ser2net TCP socket, a
//! pty, or an in-memory duplex in tests. The write half implements
//! [`SerialTransport`]; the read half feeds decoded frames into the zone
//! engine.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::zones::codec::{CodecError, DecodedFrame, SerialCommand, SerialFrameCodec};
use crate::zones::sync::ZoneSyncEngine;
use crate::zones::traits::{SerialTransport, TransportError};

/// Splits a byte channel into a frame writer and a frame reader.
pub fn split<T>(io: T) -> (SerialWriter<WriteHalf<T>>, SerialReader<ReadHalf<T>>)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(io);
    (
        SerialWriter {
            sink: Mutex::new(FramedWrite::new(write, SerialFrameCodec)),
        },
        SerialReader {
            frames: FramedRead::new(read, SerialFrameCodec),
        },
    )
}

pub struct SerialWriter<W> {
    sink: Mutex<FramedWrite<W, SerialFrameCodec>>,
}

#[async_trait]
impl<W> SerialTransport for SerialWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write(&self, command: &SerialCommand) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        sink.send(command.clone()).await.map_err(|e| match e {
            CodecError::Io(io) => TransportError::Io(io),
            other => TransportError::Rejected(other.to_string()),
        })
    }
}

pub struct SerialReader<R> {
    frames: FramedRead<R, SerialFrameCodec>,
}

impl<R> SerialReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Feeds frames into `engine` until the link closes or `cancel` fires.
    ///
    /// Malformed frames and rejected commands are logged and dropped.
    pub async fn run(mut self, engine: Arc<ZoneSyncEngine>, cancel: CancellationToken) {
        log::info!("[Serial] Reader started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = self.frames.next() => match frame {
                    Some(Ok(DecodedFrame::Command(command))) => {
                        if let Err(e) = engine.handle_serial_frame(command).await {
                            log::warn!("[Serial] Frame rejected: {}", e);
                        }
                    }
                    Some(Ok(DecodedFrame::Malformed(text))) => {
                        log::warn!("[Serial] Dropping malformed frame {:?}", text);
                    }
                    Some(Err(e)) => {
                        log::error!("[Serial] Link error: {}", e);
                        break;
                    }
                    None => {
                        log::warn!("[Serial] Link closed by peer");
                        break;
                    }
                },
            }
        }
        log::info!("[Serial] Reader stopped");
    }
}
