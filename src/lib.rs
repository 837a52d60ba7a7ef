//! Blocking POSIX-style sockets over a smoltcp interface thread.
//!
//! smoltcp is an event-driven, single-threaded stack: every socket and
//! every protocol timer must be driven from one execution context. This
//! crate puts that context on a dedicated thread per [`Stack`] and
//! gives callers a synchronous surface on top of it: `open`, `bind`,
//! `listen`, `connect`, `accept`, `send_to`, `recv_from`, `read`,
//! `write`. A call posts a closure into the stack thread and parks the
//! caller; either the closure completes the operation on the spot, or
//! it arms a per-socket wait state that a later stack event (inbound
//! data, transmit-buffer space, a finished handshake) completes.
//!
//! Traffic is accounted in monotonic [`counters`] under
//! `/inet/socket/...`, and sockets implement the generic [`Channel`]
//! contract so they can be polled alongside other channels through
//! [`PollSet`].

pub mod channel;
pub mod counters;
pub mod endpoint;
mod error;
mod rendezvous;
pub mod socket;
pub mod stack;

pub use channel::{Channel, PollSet};
pub use endpoint::InetAddr;
pub use error::Error;
pub use socket::{module_init, MsgFlags, SockType, Socket};
pub use stack::{Stack, StackConfig};
