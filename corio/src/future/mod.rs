//! Futures driving kernel I/O requests.
//!
//! Every request is an [`Op`] wrapping an [`OpPayload`]: the payload builds
//! the submission entry and converts the completion result. The payload is
//! heap allocated and handed to the reactor if the `Op` is dropped while the
//! kernel still owns it, so buffers are never freed under the kernel's feet.
mod op;
pub use self::op::{Op, OpPayload};

mod ops;
pub use self::ops::{
    Accept, AsyncCancel, Close, Connect, FutexWait, FutexWake, Nop, Read, Timeout, Write,
};
