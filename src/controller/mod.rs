//! High-level control: state cache, poller, request pipeline and the
//! connection-lifecycle manager.

pub mod cache;
pub mod manager;
pub mod motor;
pub mod poller;

pub use cache::{AxisState, AxisStatus, StateCache};
pub use manager::{AriesManager, ConnectionHandler};
pub use motor::{MotorController, OperationCallback};
pub use poller::Poller;
