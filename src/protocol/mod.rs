//! Wire protocol: command encoding, reply parsing, and request/response
//! correlation.

pub mod codec;
pub mod dispatcher;

pub use codec::{encode_command, encode_reply, error_text, request_key, Reply, ReplyKind};
pub use dispatcher::{Dispatcher, SpontaneousHandler, WaitHandle};
