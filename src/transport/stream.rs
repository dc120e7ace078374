//! Transport over any async byte stream.
//!
//! Useful for sockets, pipes, and in-memory duplex streams in tests.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::error::{Error, Result};
use crate::transport::{BoxedReader, Transport};

/// Transport wrapping an already-connected stream.
pub struct StreamTransport<S> {
    name: String,
    stream: Option<S>,
    writer: Option<WriteHalf<S>>,
    reader: Option<ReadHalf<S>>,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    /// Wraps `stream`; it is split on [`Transport::open`].
    #[must_use]
    pub fn new(name: impl Into<String>, stream: S) -> Self {
        Self {
            name: name.into(),
            stream: Some(stream),
            writer: None,
            reader: None,
        }
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    fn open(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.writer.is_some() {
                return Ok(());
            }
            let stream = self.stream.take().ok_or(Error::ChannelClosed)?;
            let (reader, writer) = tokio::io::split(stream);
            self.reader = Some(reader);
            self.writer = Some(writer);
            tracing::debug!("stream transport {} open", self.name);
            Ok(())
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if let Some(mut writer) = self.writer.take() {
                writer.shutdown().await?;
            }
            self.reader = None;
            Ok(())
        })
    }

    fn send(&mut self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let writer = self.writer.as_mut().ok_or(Error::ChannelClosed)?;
            writer.write_all(&data).await?;
            writer.flush().await?;
            Ok(())
        })
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    fn take_reader(&mut self) -> Option<BoxedReader> {
        self.reader
            .take()
            .map(|reader| Box::new(reader) as BoxedReader)
    }
}
