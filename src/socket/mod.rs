//! Blocking socket façade.
//!
//! Every public call posts a closure to the owning stack thread and
//! parks the caller until the operation completes there. Blocking
//! methods take `&mut self`, so a socket can never have more than one
//! suspended caller.

pub(crate) mod datagram;
pub(crate) mod raw;
pub(crate) mod stream;

use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, OnceLock};

use bitflags::bitflags;

use crate::counters;
use crate::endpoint::InetAddr;
use crate::error::Error;
use crate::rendezvous::{Completion, Rendezvous};
use crate::stack::{Adapter, SockId, Stack};

bitflags! {
    /// Send/receive flags, accepted for call symmetry with the POSIX
    /// surface. No flag alters behavior in this layer.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct MsgFlags: u32 {
        const PEEK = 0x02;
        const DONTWAIT = 0x40;
        const WAITALL = 0x100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Stream,
    Dgram,
    Raw,
}

static DEFAULT_STACK: OnceLock<Arc<Stack>> = OnceLock::new();

/// Registers the byte counters and brings up the default loopback
/// stack. Idempotent; later calls are no-ops.
pub fn module_init() -> Result<(), Error> {
    counters::registry();
    DEFAULT_STACK.get_or_init(Stack::loopback);
    Ok(())
}

fn default_stack() -> Result<&'static Arc<Stack>, Error> {
    DEFAULT_STACK.get().ok_or(Error::InvalidArgument)
}

/// Caller-owned receive buffer handed across to the stack thread.
/// Sound because the owning thread stays parked until the operation
/// holding it posts a completion.
#[derive(Debug)]
pub(crate) struct UserMut {
    ptr: *mut u8,
    len: usize,
}

// The buffer's owner is parked; the wrapper is the sole accessor.
unsafe impl Send for UserMut {}

impl UserMut {
    fn new(buf: &mut [u8]) -> Self {
        Self {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    ///
    /// Stack thread only, and only while the owning caller is parked.
    pub(crate) unsafe fn slice_mut(&mut self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

/// Caller-owned send buffer; see [`UserMut`].
#[derive(Debug)]
pub(crate) struct UserRef {
    ptr: *const u8,
    len: usize,
}

unsafe impl Send for UserRef {}

impl UserRef {
    fn new(buf: &[u8]) -> Self {
        Self {
            ptr: buf.as_ptr(),
            len: buf.len(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    ///
    /// Stack thread only, and only while the owning caller is parked.
    pub(crate) unsafe fn slice(&self) -> &[u8] {
        core::slice::from_raw_parts(self.ptr, self.len)
    }
}

/// A blocking socket over a [`Stack`].
#[derive(Debug)]
pub struct Socket {
    stack: Arc<Stack>,
    id: SockId,
    kind: SockType,
    /// Mirror of the held-inbound level, written by the stack thread.
    rx_level: Arc<AtomicIsize>,
    closed: bool,
}

impl Socket {
    /// Opens a TCP socket on the default stack.
    pub fn open_tcp() -> Result<Self, Error> {
        Self::open_on(default_stack()?, SockType::Stream)
    }

    /// Opens a UDP socket on the default stack.
    pub fn open_udp() -> Result<Self, Error> {
        Self::open_on(default_stack()?, SockType::Dgram)
    }

    /// Opens a raw ICMP socket on the default stack.
    pub fn open_raw() -> Result<Self, Error> {
        Self::open_on(default_stack()?, SockType::Raw)
    }

    pub fn open_tcp_on(stack: &Arc<Stack>) -> Result<Self, Error> {
        Self::open_on(stack, SockType::Stream)
    }

    pub fn open_udp_on(stack: &Arc<Stack>) -> Result<Self, Error> {
        Self::open_on(stack, SockType::Dgram)
    }

    pub fn open_raw_on(stack: &Arc<Stack>) -> Result<Self, Error> {
        Self::open_on(stack, SockType::Raw)
    }

    fn open_on(stack: &Arc<Stack>, kind: SockType) -> Result<Self, Error> {
        counters::registry();
        let id = stack.alloc_id();
        let rx_level = Arc::new(AtomicIsize::new(0));
        let level = rx_level.clone();
        let done = stack.call_with(move |ctx, waiter| {
            let res = match kind {
                SockType::Dgram => datagram::DatagramAdapter::open(ctx, id, level),
                SockType::Stream => stream::StreamAdapter::open(ctx, id, level),
                SockType::Raw => raw::RawAdapter::open(ctx, id, level),
            };
            waiter.post(match res {
                Ok(()) => Completion::ok(0),
                Err(e) => Completion::err(e),
            });
        });
        done.res?;
        Ok(Self {
            stack: stack.clone(),
            id,
            kind,
            rx_level,
            closed: false,
        })
    }

    pub fn kind(&self) -> SockType {
        self.kind
    }

    /// Tears the socket down. Always succeeds; the stream variant
    /// starts a graceful close and returns without waiting for the FIN
    /// exchange to finish.
    pub fn close(mut self) -> Result<(), Error> {
        self.do_close();
        Ok(())
    }

    fn do_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let id = self.id;
        let _ = self.stack.call_with(move |ctx, waiter| {
            match ctx.adapters.remove(&id) {
                Some(Adapter::Datagram(a)) => a.close(ctx.sockets, ctx.ports),
                Some(Adapter::Stream(a)) => a.close(ctx.sockets, ctx.ports, ctx.reap),
                Some(Adapter::Raw(a)) => a.close(ctx.sockets),
                None => {}
            }
            waiter.post(Completion::ok(0));
        });
    }

    /// Binds to a local address. Valid for stream and datagram sockets.
    pub fn bind(&mut self, local: InetAddr) -> Result<(), Error> {
        let id = self.id;
        let done = match self.kind {
            SockType::Dgram => self.stack.call_with(move |ctx, waiter| {
                let res = match ctx.adapters.get_mut(&id) {
                    Some(Adapter::Datagram(a)) => a.bind(ctx.sockets, ctx.ports, local),
                    _ => Err(Error::InvalidArgument),
                };
                waiter.post(match res {
                    Ok(()) => Completion::ok(0),
                    Err(e) => Completion::err(e),
                });
            }),
            SockType::Stream => self.stack.call_with(move |ctx, waiter| {
                let res = match ctx.adapters.get_mut(&id) {
                    Some(Adapter::Stream(a)) => a.bind(ctx.ports, local),
                    _ => Err(Error::InvalidArgument),
                };
                waiter.post(match res {
                    Ok(()) => Completion::ok(0),
                    Err(e) => Completion::err(e),
                });
            }),
            SockType::Raw => return Err(Error::InvalidArgument),
        };
        done.res.map(|_| ())
    }

    /// Starts listening. Stream sockets only.
    pub fn listen(&mut self, backlog: usize) -> Result<(), Error> {
        if self.kind != SockType::Stream {
            return Err(Error::InvalidArgument);
        }
        let id = self.id;
        let done = self.stack.call_with(move |ctx, waiter| {
            let res = match ctx.adapters.get_mut(&id) {
                Some(Adapter::Stream(a)) => a.listen(ctx.sockets, backlog),
                _ => Err(Error::InvalidArgument),
            };
            waiter.post(match res {
                Ok(()) => Completion::ok(0),
                Err(e) => Completion::err(e),
            });
        });
        done.res.map(|_| ())
    }

    /// Connects to a remote address. Stream sockets park until the
    /// handshake finishes; datagram sockets just install the default
    /// destination.
    pub fn connect(&mut self, remote: InetAddr) -> Result<(), Error> {
        let id = self.id;
        let done = match self.kind {
            SockType::Stream => self.stack.call_with(move |ctx, waiter| {
                match ctx.adapters.get_mut(&id) {
                    Some(Adapter::Stream(a)) => {
                        a.connect(ctx.sockets, ctx.iface, ctx.ports, waiter, remote)
                    }
                    _ => {
                        waiter.post(Completion::err(Error::InvalidArgument));
                    }
                }
            }),
            SockType::Dgram => self.stack.call_with(move |ctx, waiter| {
                let res = match ctx.adapters.get_mut(&id) {
                    Some(Adapter::Datagram(a)) => a.connect(ctx.sockets, ctx.ports, remote),
                    _ => Err(Error::InvalidArgument),
                };
                waiter.post(match res {
                    Ok(()) => Completion::ok(0),
                    Err(e) => Completion::err(e),
                });
            }),
            SockType::Raw => return Err(Error::InvalidArgument),
        };
        done.res.map(|_| ())
    }

    /// Documented surface; name resolution is not wired up yet, the
    /// call always fails.
    pub fn connect_by_hostname(&mut self, host: &str, _port: u16) -> Result<(), Error> {
        if self.kind != SockType::Stream || host.is_empty() {
            return Err(Error::InvalidArgument);
        }
        Err(Error::Unsupported)
    }

    /// Takes the next incoming connection, parking until one arrives.
    /// Stream sockets only.
    pub fn accept(&mut self) -> Result<(Socket, InetAddr), Error> {
        if self.kind != SockType::Stream {
            return Err(Error::InvalidArgument);
        }
        let id = self.id;
        let new_id = self.stack.alloc_id();
        let new_level = Arc::new(AtomicIsize::new(0));
        let level = new_level.clone();
        let done = self.stack.call_with(move |ctx, waiter| {
            let added = match ctx.adapters.get_mut(&id) {
                Some(Adapter::Stream(a)) => a.accept(ctx.sockets, waiter, new_id, level),
                _ => {
                    waiter.post(Completion::err(Error::InvalidArgument));
                    None
                }
            };
            if let Some((accepted_id, adapter)) = added {
                ctx.adapters.insert(accepted_id, adapter);
            }
        });
        done.res?;
        let remote = done.remote.ok_or(Error::Protocol)?;
        Ok((
            Socket {
                stack: self.stack.clone(),
                id: new_id,
                kind: SockType::Stream,
                rx_level: new_level,
                closed: false,
            },
            remote,
        ))
    }

    /// Sends `buf`, parking until the stack has taken all of it. For
    /// datagram and raw sockets `remote` names the destination (raw
    /// requires it, datagram falls back to the connected default);
    /// stream sockets ignore it.
    pub fn send_to(
        &mut self,
        buf: &[u8],
        flags: MsgFlags,
        remote: Option<InetAddr>,
    ) -> Result<usize, Error> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if flags.contains(MsgFlags::DONTWAIT) {
            log::warn!("non-blocking send is not implemented");
        }
        let id = self.id;
        let data = UserRef::new(buf);
        let done = match self.kind {
            SockType::Dgram => self.stack.call_with(move |ctx, waiter| {
                let done = match ctx.adapters.get_mut(&id) {
                    Some(Adapter::Datagram(a)) => a.send_to(ctx.sockets, ctx.ports, data, remote),
                    _ => Completion::err(Error::InvalidArgument),
                };
                waiter.post(done);
            }),
            SockType::Stream => self.stack.call_with(move |ctx, waiter| {
                match ctx.adapters.get_mut(&id) {
                    Some(Adapter::Stream(a)) => a.send(ctx.sockets, waiter, data),
                    _ => {
                        waiter.post(Completion::err(Error::InvalidArgument));
                    }
                }
            }),
            SockType::Raw => self.stack.call_with(move |ctx, waiter| {
                let done = match (ctx.adapters.get_mut(&id), remote) {
                    (Some(Adapter::Raw(a)), Some(remote)) => {
                        a.send_to(ctx.sockets, ctx.iface, data, remote)
                    }
                    (Some(Adapter::Raw(_)), None) => Completion::err(Error::InvalidArgument),
                    _ => Completion::err(Error::InvalidArgument),
                };
                waiter.post(done);
            }),
        };
        done.res
    }

    /// Receives into `buf`, parking until data is available. Returns
    /// the byte count and, where the protocol has one, the source
    /// address. A stream read returns `Ok(0)` once the peer has closed.
    pub fn recv_from(
        &mut self,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> Result<(usize, Option<InetAddr>), Error> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if flags.contains(MsgFlags::DONTWAIT) {
            log::warn!("non-blocking receive is not implemented");
        }
        let id = self.id;
        let dst = UserMut::new(buf);
        let done = match self.kind {
            SockType::Dgram => self.stack.call_with(move |ctx, waiter| {
                match ctx.adapters.get_mut(&id) {
                    Some(Adapter::Datagram(a)) => a.recv_from(waiter, dst),
                    _ => {
                        waiter.post(Completion::err(Error::InvalidArgument));
                    }
                }
            }),
            SockType::Stream => self.stack.call_with(move |ctx, waiter| {
                match ctx.adapters.get_mut(&id) {
                    Some(Adapter::Stream(a)) => a.recv(ctx.sockets, waiter, dst),
                    _ => {
                        waiter.post(Completion::err(Error::InvalidArgument));
                    }
                }
            }),
            SockType::Raw => self.stack.call_with(move |ctx, waiter| {
                match ctx.adapters.get_mut(&id) {
                    Some(Adapter::Raw(a)) => a.recv_from(waiter, dst),
                    _ => {
                        waiter.post(Completion::err(Error::InvalidArgument));
                    }
                }
            }),
        };
        Ok((done.res?, done.remote))
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.send_to(buf, MsgFlags::empty(), None)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.recv_from(buf, MsgFlags::empty()).map(|(n, _)| n)
    }

    /// Non-zero iff inbound data (or EOF, or a pending connection) is
    /// held for this socket. Poll-layer hook; advisory between polls.
    pub fn size(&self) -> usize {
        (self.rx_level.load(Ordering::Relaxed) != 0) as usize
    }

    pub(crate) fn same_stack(&self, other: &Socket) -> bool {
        Arc::ptr_eq(&self.stack, &other.stack)
    }

    /// Registers `waiter` as this socket's poll waiter, unless the
    /// socket is already readable. Returns the readiness at
    /// registration time.
    pub(crate) fn poll_register(&self, waiter: &Arc<Rendezvous>) -> bool {
        let id = self.id;
        let theirs = waiter.clone();
        let done = self.stack.call_with(move |ctx, waiter| {
            let ready = match ctx.adapters.get_mut(&id) {
                Some(Adapter::Datagram(a)) => a.poll_register(theirs),
                Some(Adapter::Stream(a)) => a.poll_register(theirs),
                Some(Adapter::Raw(a)) => a.poll_register(theirs),
                None => true,
            };
            waiter.post(Completion::ok(ready as usize));
        });
        matches!(done.res, Ok(1))
    }

    pub(crate) fn poll_clear(&self) {
        let id = self.id;
        let _ = self.stack.call_with(move |ctx, waiter| {
            match ctx.adapters.get_mut(&id) {
                Some(Adapter::Datagram(a)) => a.poll_clear(),
                Some(Adapter::Stream(a)) => a.poll_clear(),
                Some(Adapter::Raw(a)) => a.poll_clear(),
                None => {}
            }
            waiter.post(Completion::ok(0));
        });
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.do_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::Stack;

    #[test]
    fn wrong_type_operations_are_rejected() {
        let stack = Stack::loopback();
        let mut udp = Socket::open_udp_on(&stack).unwrap();
        assert_eq!(udp.listen(1), Err(Error::InvalidArgument));
        assert_eq!(
            udp.connect_by_hostname("example.com", 80),
            Err(Error::InvalidArgument)
        );

        let mut raw = Socket::open_raw_on(&stack).unwrap();
        assert_eq!(
            raw.bind(InetAddr::v4(127, 0, 0, 1, 9000)),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            raw.connect(InetAddr::v4(127, 0, 0, 1, 9000)),
            Err(Error::InvalidArgument)
        );

        let mut tcp = Socket::open_tcp_on(&stack).unwrap();
        assert_eq!(
            tcp.connect_by_hostname("example.com", 80),
            Err(Error::Unsupported)
        );
    }

    #[test]
    fn empty_buffers_are_rejected() {
        let stack = Stack::loopback();
        let mut udp = Socket::open_udp_on(&stack).unwrap();
        assert_eq!(udp.write(&[]), Err(Error::InvalidArgument));
        let mut empty: [u8; 0] = [];
        assert_eq!(udp.read(&mut empty), Err(Error::InvalidArgument));
    }

    #[test]
    fn datagram_send_without_destination_fails() {
        let stack = Stack::loopback();
        let mut udp = Socket::open_udp_on(&stack).unwrap();
        assert_eq!(
            udp.send_to(b"x", MsgFlags::empty(), None),
            Err(Error::Protocol)
        );
    }

    #[test]
    fn raw_send_requires_a_destination() {
        let stack = Stack::loopback();
        let mut raw = Socket::open_raw_on(&stack).unwrap();
        assert_eq!(
            raw.send_to(b"x", MsgFlags::empty(), None),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn listen_requires_a_bound_address() {
        let stack = Stack::loopback();
        let mut tcp = Socket::open_tcp_on(&stack).unwrap();
        assert_eq!(tcp.listen(1), Err(Error::Protocol));
    }
}
