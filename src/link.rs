//! Framed command/response link to the dongle.
//!
//! The link owns a background I/O task that reads the transport, reassembles
//! frames and decodes them. Responses fulfill the single pending
//! [`Link::exchange`]; events go to the registered event callback, on the
//! I/O task.
//!
//! A response that arrives while no exchange is pending is dropped. It is
//! logged at `debug` level and otherwise leaves no trace.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::callback::Callback;
use crate::error::{Error, Result};
use crate::protocol::{Command, Event, FrameDecoder, Message, Response, encode_frame};
use crate::transport::{BoxedReader, Transport};

/// Default time to wait for a response.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(1);

type PendingSlot = Mutex<Option<oneshot::Sender<Response>>>;

/// State shared between callers and the I/O task.
struct Shared {
    pending: PendingSlot,
    on_event: Callback<Event>,
}

impl Shared {
    fn dispatch(&self, payload: &[u8]) {
        match Message::decode(payload) {
            Ok(Message::Response(response)) => {
                let sender = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                match sender {
                    Some(tx) => {
                        if tx.send(response).is_err() {
                            tracing::debug!("exchange abandoned before its response arrived");
                        }
                    }
                    None => tracing::debug!("ignoring unsolicited response: {:?}", response),
                }
            }
            Ok(Message::Event(event)) => {
                tracing::trace!("event: {:?}", event);
                if !self.on_event.call(event) {
                    tracing::trace!("no event callback registered");
                }
            }
            Err(e) => {
                tracing::warn!("dropping undecodable frame: {}", e);
            }
        }
    }
}

/// A framed, single-flight command link.
pub struct Link {
    name: String,
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    shared: Arc<Shared>,
    exchange_timeout: Duration,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    /// Opens `transport` and starts the I/O task.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be opened or yields no reader.
    pub async fn open(mut transport: Box<dyn Transport>, exchange_timeout: Duration) -> Result<Self> {
        transport.open().await?;
        let reader = transport.take_reader().ok_or(Error::ChannelClosed)?;
        let name = transport.name();

        let shared = Arc::new(Shared {
            pending: Mutex::new(None),
            on_event: Callback::new(),
        });

        let task_shared = Arc::clone(&shared);
        let task_name = name.clone();
        let io_task = tokio::spawn(async move {
            if let Err(e) = run_io_loop(reader, &task_shared).await {
                tracing::error!("read loop on {} stopped: {}", task_name, e);
            }
            // Fail a waiting exchange now instead of at its timeout.
            task_shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        });

        tracing::debug!("link open on {}", name);
        Ok(Self {
            name,
            transport: tokio::sync::Mutex::new(transport),
            shared,
            exchange_timeout,
            io_task: Mutex::new(Some(io_task)),
        })
    }

    /// Name of the underlying transport.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers the handler for unsolicited events, replacing any other.
    ///
    /// The handler runs on the I/O task and must not wait on an exchange.
    pub fn set_event_callback(&self, handler: impl Fn(Event) + Send + Sync + 'static) {
        self.shared.on_event.load(handler);
    }

    /// Sends `command` and waits for its response.
    ///
    /// Only one exchange may be pending at a time; a concurrent call fails
    /// right away instead of queueing.
    ///
    /// # Errors
    ///
    /// - [`Error::ExchangeBusy`] if another exchange is pending.
    /// - [`Error::Timeout`] if no response arrives in time. The link stays
    ///   usable.
    /// - [`Error::ChannelClosed`] if the I/O task has stopped.
    pub async fn exchange(&self, command: Command) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.lock_pending();
            // A closed sender belongs to a caller that gave up; reuse the slot.
            if slot.as_ref().is_some_and(|pending| !pending.is_closed()) {
                return Err(Error::ExchangeBusy);
            }
            *slot = Some(tx);
        }

        let opcode = command.opcode();
        tracing::trace!("exchange {}: {:?}", opcode.name(), command);

        if let Err(e) = self.send(&command).await {
            self.lock_pending().take();
            return Err(e);
        }

        match tokio::time::timeout(self.exchange_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                self.lock_pending().take();
                tracing::debug!("exchange {} timed out", opcode.name());
                Err(Error::Timeout {
                    operation: opcode.name(),
                    timeout_ms: u64::try_from(self.exchange_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                })
            }
        }
    }

    async fn send(&self, command: &Command) -> Result<()> {
        let frame = encode_frame(&command.encode())?;
        let mut transport = self.transport.lock().await;
        transport.send(frame).await
    }

    /// Returns true while the I/O task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.io_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stops the I/O task and closes the transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to close.
    pub async fn close(&self) -> Result<()> {
        let task = self
            .io_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.shared.on_event.unload();
        self.lock_pending().take();

        let mut transport = self.transport.lock().await;
        transport.close().await?;
        tracing::debug!("link on {} closed", self.name);
        Ok(())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<oneshot::Sender<Response>>> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(task) = self
            .io_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// Reads until the transport closes, dispatching every complete frame.
async fn run_io_loop(mut reader: BoxedReader, shared: &Shared) -> Result<()> {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 1024];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            tracing::debug!("transport closed");
            return Ok(());
        }

        tracing::trace!("received {} bytes: {}", n, hex::encode(&buf[..n]));
        for result in decoder.feed(&buf[..n]) {
            match result {
                Ok(payload) => shared.dispatch(&payload),
                Err(e) => tracing::warn!("dropping frame: {}", e),
            }
        }
    }
}
