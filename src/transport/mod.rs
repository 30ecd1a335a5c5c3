//! Line-framed transport abstractions.
//!
//! [`LineTransport`] is the seam between the protocol layer and the network:
//! the motor controller installs a line handler and a disconnect handler and
//! otherwise only submits complete, already-framed lines. The production
//! implementation is [`TcpTransport`]; tests drive the same code over an
//! in-memory duplex stream.

pub mod tcp;
pub mod writer;

use crate::error::AriesResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

pub use tcp::TcpTransport;
pub use writer::Writer;

/// Any bidirectional async byte stream usable as the wire.
///
/// Covers `tokio::net::TcpStream` for hardware and `tokio::io::DuplexStream`
/// for tests.
pub trait StreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamIo for T {}

/// Type-erased boxed stream.
pub type DynStream = Box<dyn StreamIo>;

/// Callback receiving each complete inbound line, CRLF stripped.
///
/// Invoked from the transport's read task; implementations must not block.
pub type LineHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Callback fired exactly once per connected-to-disconnected edge.
///
/// Dispatched asynchronously, never from the failing I/O call stack, so the
/// handler may safely call back into the transport.
pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Contract for a line-oriented client transport.
#[async_trait]
pub trait LineTransport: Send + Sync {
    /// Establish the connection.
    async fn connect(&self, host: &str, port: u16) -> AriesResult<()>;

    /// Begin background I/O (the read loop). Requires a prior `connect`.
    async fn start(&self) -> AriesResult<()>;

    /// Cease I/O and release the socket. Triggers the disconnect edge if the
    /// transport was still connected.
    async fn stop(&self);

    /// Submit one complete, already-framed line for transmission.
    ///
    /// Concurrent calls never interleave bytes on the wire.
    async fn send_line(&self, line: &str) -> AriesResult<()>;

    fn set_line_handler(&self, handler: Option<LineHandler>);

    fn set_disconnect_handler(&self, handler: Option<DisconnectHandler>);

    fn is_connected(&self) -> bool;
}
