//! TCP implementation of [`LineTransport`].
//!
//! A background read task splits the inbound byte stream on line endings and
//! delivers each complete line to the registered handler. Writes go through
//! one async mutex so concurrent senders serialize cleanly. Nagle is disabled
//! on connect to keep per-command latency low.
//!
//! The disconnect edge (peer close, read/write error, or explicit `stop`)
//! flips an atomic exactly once and dispatches the disconnect handler on a
//! fresh task, never from the failing I/O call stack.

use crate::error::{AriesError, AriesResult};
use crate::transport::{DisconnectHandler, DynStream, LineHandler, LineTransport, StreamIo};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

pub struct TcpTransport {
    inner: Arc<Shared>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    /// Read half parked between `connect` and `start`.
    read_half: Mutex<Option<ReadHalf<DynStream>>>,
}

struct Shared {
    connected: AtomicBool,
    write_half: tokio::sync::Mutex<Option<WriteHalf<DynStream>>>,
    line_handler: Mutex<Option<LineHandler>>,
    disconnect_handler: Mutex<Option<DisconnectHandler>>,
}

impl Shared {
    /// Flip to disconnected and fire the handler once per edge.
    fn mark_disconnected(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let handler = self
            .disconnect_handler
            .lock()
            .expect("disconnect handler poisoned")
            .clone();
        if let Some(handler) = handler {
            tokio::spawn(async move { handler() });
        }
    }

    fn deliver_line(&self, line: String) {
        let handler = self
            .line_handler
            .lock()
            .expect("line handler poisoned")
            .clone();
        match handler {
            Some(handler) => handler(line),
            None => debug!("no line handler registered, dropping: {line:?}"),
        }
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Shared {
                connected: AtomicBool::new(false),
                write_half: tokio::sync::Mutex::new(None),
                line_handler: Mutex::new(None),
                disconnect_handler: Mutex::new(None),
            }),
            reader_task: Mutex::new(None),
            read_half: Mutex::new(None),
        }
    }

    /// Build a transport over an arbitrary connected stream.
    ///
    /// Used by tests with `tokio::io::duplex`; the hardware path goes through
    /// [`LineTransport::connect`].
    pub fn with_stream<S: StreamIo + 'static>(stream: S) -> Self {
        let transport = Self::new();
        transport.adopt_stream(Box::new(stream));
        transport
    }

    fn adopt_stream(&self, stream: DynStream) {
        let (rh, wh) = tokio::io::split(stream);
        *self.read_half.lock().expect("read half poisoned") = Some(rh);
        // Not yet started, so the async mutex cannot be contended here.
        *self
            .inner
            .write_half
            .try_lock()
            .expect("write half contended before start") = Some(wh);
        self.inner.connected.store(true, Ordering::SeqCst);
    }

    async fn read_loop(shared: Arc<Shared>, rh: ReadHalf<DynStream>) {
        let mut reader = BufReader::new(rh);
        let mut buf: Vec<u8> = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => {
                    debug!("peer closed connection");
                    shared.mark_disconnected();
                    break;
                }
                Ok(_) => {
                    if buf.last() != Some(&b'\n') {
                        // Partial line at EOF; the next read reports it.
                        continue;
                    }
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    shared.deliver_line(line);
                }
                Err(e) => {
                    warn!("socket read failed: {e}");
                    shared.mark_disconnected();
                    break;
                }
            }
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LineTransport for TcpTransport {
    async fn connect(&self, host: &str, port: u16) -> AriesResult<()> {
        if self.inner.connected.load(Ordering::SeqCst) {
            return Err(AriesError::Transport("already connected".into()));
        }
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(AriesError::transport)?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY: {e}");
        }
        self.adopt_stream(Box::new(stream));
        Ok(())
    }

    async fn start(&self) -> AriesResult<()> {
        let rh = self
            .read_half
            .lock()
            .expect("read half poisoned")
            .take()
            .ok_or(AriesError::NotConnected)?;
        let shared = Arc::clone(&self.inner);
        let task = tokio::spawn(Self::read_loop(shared, rh));
        *self.reader_task.lock().expect("reader task poisoned") = Some(task);
        Ok(())
    }

    async fn stop(&self) {
        self.inner.mark_disconnected();
        if let Some(task) = self.reader_task.lock().expect("reader task poisoned").take() {
            task.abort();
        }
        let mut wh = self.inner.write_half.lock().await;
        if let Some(mut half) = wh.take() {
            let _ = half.shutdown().await;
        }
        self.read_half.lock().expect("read half poisoned").take();
    }

    async fn send_line(&self, line: &str) -> AriesResult<()> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(AriesError::NotConnected);
        }
        let mut guard = self.inner.write_half.lock().await;
        let wh = guard.as_mut().ok_or(AriesError::NotConnected)?;
        let result = async {
            wh.write_all(line.as_bytes()).await?;
            wh.flush().await
        }
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("socket write failed: {e}");
                drop(guard);
                self.inner.mark_disconnected();
                Err(AriesError::transport(e))
            }
        }
    }

    fn set_line_handler(&self, handler: Option<LineHandler>) {
        *self.inner.line_handler.lock().expect("line handler poisoned") = handler;
    }

    fn set_disconnect_handler(&self, handler: Option<DisconnectHandler>) {
        *self
            .inner
            .disconnect_handler
            .lock()
            .expect("disconnect handler poisoned") = handler;
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}
