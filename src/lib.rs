//! # kohzu-aries
//!
//! Async client driver for Kohzu ARIES/LYNX multi-axis motion controllers
//! speaking their line-oriented ASCII protocol over TCP.
//!
//! The crate hides the transport, request/response correlation, spontaneous
//! device notifications, reconnection and background polling behind a small
//! surface: construct an [`AriesManager`](controller::AriesManager), start
//! it, move axes, and read the cached state.
//!
//! ## Module map
//!
//! - **`config`**: [`DriverConfig`](config::DriverConfig) with the timeout,
//!   cadence and queue defaults, TOML loading and validation.
//! - **`error`**: [`AriesError`](error::AriesError), the single error enum
//!   every fallible API returns.
//! - **`protocol`**: the wire codec (command encode, reply decode) and the
//!   dispatcher correlating replies to pending requests by `CMD:axis` key.
//! - **`transport`**: the [`LineTransport`](transport::LineTransport) seam,
//!   its TCP implementation, and the bounded serialized writer.
//! - **`controller`**: the per-axis state cache, the two-cadence poller, the
//!   request pipeline ([`MotorController`](controller::MotorController)) and
//!   the lifecycle-owning manager.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use kohzu_aries::config::DriverConfig;
//! use kohzu_aries::controller::AriesManager;
//!
//! let config = DriverConfig {
//!     host: "192.168.1.120".into(),
//!     port: 12321,
//!     auto_reconnect: true,
//!     ..Default::default()
//! };
//! let manager = AriesManager::new(config)?;
//! manager.set_poll_axes(vec![1, 2]);
//! manager.start().await?;
//! manager.move_absolute_async(1, 1000, 0, 0, |reply| {
//!     println!("move finished: {reply:?}");
//! })?;
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod protocol;
pub mod transport;

pub use config::DriverConfig;
pub use controller::{AriesManager, AxisState, AxisStatus, StateCache};
pub use error::{AriesError, AriesResult};
pub use protocol::{Reply, ReplyKind};
