//! Stream (TCP) adapter.
//!
//! A send larger than the transmit ring parks the caller in
//! `SEND_PENDING`; every sent-acknowledgement event writes the next
//! chunk until the whole buffer has been handed to the stack. A receive
//! parks in `RECV_PENDING` until the caller's buffer is full, or until
//! the peer closes (reported as a zero-length read, partial fills
//! discarded).
//!
//! A listener holds at most one established-but-unaccepted connection.
//! While it is held the listening handle has been consumed, so further
//! connection attempts to the port are answered with RST; `accept`
//! installs a fresh listening socket under the same local endpoint.

use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

use smoltcp::iface::{Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp;
use smoltcp::wire::{IpEndpoint, IpListenEndpoint};

use crate::counters;
use crate::endpoint::InetAddr;
use crate::error::Error;
use crate::rendezvous::{Completion, Rendezvous};
use crate::stack::port::{PortManager, PortProto};
use crate::stack::{Adapter, SockId, StackCtx};

use super::{UserMut, UserRef};

pub(crate) const TCP_RX_BUF_SIZE: usize = 8 * 1024;
pub(crate) const TCP_TX_BUF_SIZE: usize = 2 * 1024;

fn new_socket() -> tcp::Socket<'static> {
    let rx = tcp::SocketBuffer::new(vec![0; TCP_RX_BUF_SIZE]);
    let tx = tcp::SocketBuffer::new(vec![0; TCP_TX_BUF_SIZE]);
    tcp::Socket::new(rx, tx)
}

#[derive(Debug)]
pub(crate) struct StreamAdapter {
    id: SockId,
    handle: SocketHandle,
    /// Local endpoint recorded by bind; also owns the port table entry.
    local: Option<IpListenEndpoint>,
    listening: bool,
    /// Has reached `Established` at least once; EOF is only meaningful
    /// afterwards.
    connected: bool,
    wait: Wait,
    pending_connect: Option<Arc<Rendezvous>>,
    /// At most one accepted-but-not-delivered connection.
    accept_pcb: Option<SocketHandle>,
    poll_waiter: Option<Arc<Rendezvous>>,
    rx_level: Arc<AtomicIsize>,
}

#[derive(Debug)]
enum Wait {
    Idle,
    Recv(RecvWait),
    Accept(AcceptWait),
    Send(SendWait),
}

#[derive(Debug)]
struct RecvWait {
    waiter: Arc<Rendezvous>,
    buf: UserMut,
    size: usize,
    pos: usize,
}

#[derive(Debug)]
struct SendWait {
    waiter: Arc<Rendezvous>,
    buf: UserRef,
    size: usize,
    pos: usize,
}

#[derive(Debug)]
struct AcceptWait {
    waiter: Arc<Rendezvous>,
    new_id: SockId,
    new_level: Arc<AtomicIsize>,
}

/// One step of the stream receive: drain what the ring holds into the
/// caller's buffer. Completes (and posts) when the buffer is full or
/// the connection cannot deliver more.
fn copy_step(sock: &mut tcp::Socket<'_>, wait: &mut RecvWait) -> bool {
    // SAFETY: the reading thread stays parked until a completion is
    // posted below; nothing else aliases its buffer.
    let dst = unsafe { &mut wait.buf.slice_mut()[wait.pos..] };
    match sock.recv_slice(dst) {
        Ok(n) => {
            wait.pos += n;
            if wait.pos < wait.size {
                return false;
            }
            counters::registry().tcp_rx_bytes.add(wait.size as u64);
            let remote = sock
                .remote_endpoint()
                .and_then(|ep| InetAddr::try_from(ep).ok());
            wait.waiter.post(Completion {
                res: Ok(wait.size),
                remote,
            });
            true
        }
        Err(tcp::RecvError::Finished) => {
            wait.waiter.post(Completion::ok(0));
            true
        }
        Err(tcp::RecvError::InvalidState) => {
            wait.waiter.post(Completion::err(Error::Protocol));
            true
        }
    }
}

/// One step of the chunked send: hand the stack as much as the
/// transmit ring accepts. Completes when everything has been written.
fn send_step(sock: &mut tcp::Socket<'_>, wait: &mut SendWait) -> bool {
    // SAFETY: the writing thread stays parked until a completion is
    // posted below.
    let src = unsafe { &wait.buf.slice()[wait.pos..] };
    match sock.send_slice(src) {
        Ok(n) => {
            wait.pos += n;
            if wait.pos < wait.size {
                return false;
            }
            counters::registry().tcp_tx_bytes.add(wait.size as u64);
            wait.waiter.post(Completion::ok(wait.size));
            true
        }
        // A write on a dead connection reports zero bytes.
        Err(tcp::SendError::InvalidState) => {
            wait.waiter.post(Completion::ok(0));
            true
        }
    }
}

impl StreamAdapter {
    pub(crate) fn open(
        ctx: &mut StackCtx<'_>,
        id: SockId,
        rx_level: Arc<AtomicIsize>,
    ) -> Result<(), Error> {
        let handle = ctx.sockets.add(new_socket());
        ctx.adapters.insert(
            id,
            Adapter::Stream(Self {
                id,
                handle,
                local: None,
                listening: false,
                connected: false,
                wait: Wait::Idle,
                pending_connect: None,
                accept_pcb: None,
                poll_waiter: None,
                rx_level,
            }),
        );
        Ok(())
    }

    /// Graceful teardown: the handle stays on the reap list until the
    /// FIN (or RST for a refused pending accept) has gone out and the
    /// state machine reaches `Closed`.
    pub(crate) fn close(
        mut self,
        sockets: &mut SocketSet<'static>,
        ports: &mut PortManager,
        reap: &mut Vec<SocketHandle>,
    ) {
        if let Some(local) = self.local {
            if local.port != 0 {
                ports.release(PortProto::Tcp, local.port);
            }
        }
        let sock = sockets.get_mut::<tcp::Socket>(self.handle);
        if self.accept_pcb.take().is_some() {
            // A never-delivered connection is refused outright.
            sock.abort();
        } else {
            sock.close();
        }
        reap.push(self.handle);
    }

    pub(crate) fn bind(&mut self, ports: &mut PortManager, local: InetAddr) -> Result<(), Error> {
        ports.bind(PortProto::Tcp, local.port, self.id)?;
        self.local = Some(local.listen_endpoint());
        Ok(())
    }

    /// Backlog beyond the single pending-connection slot is advisory.
    pub(crate) fn listen(
        &mut self,
        sockets: &mut SocketSet<'_>,
        _backlog: usize,
    ) -> Result<(), Error> {
        let Some(local) = self.local else {
            return Err(Error::Protocol);
        };
        let sock = sockets.get_mut::<tcp::Socket>(self.handle);
        sock.listen(local).map_err(|_| Error::Protocol)?;
        self.listening = true;
        Ok(())
    }

    pub(crate) fn connect(
        &mut self,
        sockets: &mut SocketSet<'_>,
        iface: &mut Interface,
        ports: &mut PortManager,
        waiter: &Arc<Rendezvous>,
        remote: InetAddr,
    ) {
        let local = match self.local {
            Some(local) => local,
            None => match ports.ephemeral(PortProto::Tcp, self.id) {
                Ok(port) => {
                    let local = IpListenEndpoint::from(port);
                    self.local = Some(local);
                    local
                }
                Err(e) => {
                    waiter.post(Completion::err(e));
                    return;
                }
            },
        };
        let sock = sockets.get_mut::<tcp::Socket>(self.handle);
        match sock.connect(iface.context(), IpEndpoint::from(remote), local) {
            // Resumed by the connection event once the handshake ends.
            Ok(()) => self.pending_connect = Some(waiter.clone()),
            Err(_) => {
                waiter.post(Completion::err(Error::Protocol));
            }
        }
    }

    /// Returns the accepted socket's adapter entry when the slot could
    /// be consumed right away.
    pub(crate) fn accept(
        &mut self,
        sockets: &mut SocketSet<'static>,
        waiter: &Arc<Rendezvous>,
        new_id: SockId,
        new_level: Arc<AtomicIsize>,
    ) -> Option<(SockId, Adapter)> {
        if !self.listening {
            waiter.post(Completion::err(Error::Protocol));
            return None;
        }
        if self.accept_pcb.is_none() {
            // Resumed by the accept event once a handshake completes.
            self.wait = Wait::Accept(AcceptWait {
                waiter: waiter.clone(),
                new_id,
                new_level,
            });
            return None;
        }
        match self.complete_accept(sockets, new_id, new_level) {
            Ok((adapter, remote)) => {
                waiter.post(Completion {
                    res: Ok(0),
                    remote: Some(remote),
                });
                Some((new_id, adapter))
            }
            Err(e) => {
                waiter.post(Completion::err(e));
                None
            }
        }
    }

    /// Consumes the pending connection: re-arms the listener under a
    /// fresh handle and builds the accepted socket's adapter.
    fn complete_accept(
        &mut self,
        sockets: &mut SocketSet<'static>,
        new_id: SockId,
        new_level: Arc<AtomicIsize>,
    ) -> Result<(Adapter, InetAddr), Error> {
        let conn = self.accept_pcb.take().ok_or(Error::Protocol)?;
        let mut listener = new_socket();
        if let Some(local) = self.local {
            if let Err(e) = listener.listen(local) {
                log::warn!("re-listen on {:?} failed: {:?}", local, e);
            }
        }
        self.handle = sockets.add(listener);
        self.rx_level.store(0, Ordering::Relaxed);

        let remote = sockets
            .get::<tcp::Socket>(conn)
            .remote_endpoint()
            .and_then(|ep| InetAddr::try_from(ep).ok());
        let Some(remote) = remote else {
            // The connection died while parked in the accept slot.
            sockets.remove(conn);
            return Err(Error::Protocol);
        };
        counters::registry().tcp_accepts.add(1);
        new_level.store(
            sockets.get::<tcp::Socket>(conn).recv_queue() as isize,
            Ordering::Relaxed,
        );
        let adapter = Self {
            id: new_id,
            handle: conn,
            // The port table entry stays with the listener.
            local: None,
            listening: false,
            connected: true,
            wait: Wait::Idle,
            pending_connect: None,
            accept_pcb: None,
            poll_waiter: None,
            rx_level: new_level,
        };
        Ok((Adapter::Stream(adapter), remote))
    }

    pub(crate) fn recv(
        &mut self,
        sockets: &mut SocketSet<'_>,
        waiter: &Arc<Rendezvous>,
        buf: UserMut,
    ) {
        let size = buf.len();
        let mut wait = RecvWait {
            waiter: waiter.clone(),
            buf,
            size,
            pos: 0,
        };
        let sock = sockets.get_mut::<tcp::Socket>(self.handle);
        if self.connected && !sock.may_recv() {
            // Peer already closed and the ring is drained.
            waiter.post(Completion::ok(0));
            return;
        }
        if !copy_step(&mut *sock, &mut wait) {
            self.wait = Wait::Recv(wait);
        }
        self.rx_level
            .store(sock.recv_queue() as isize, Ordering::Relaxed);
    }

    pub(crate) fn send(
        &mut self,
        sockets: &mut SocketSet<'_>,
        waiter: &Arc<Rendezvous>,
        buf: UserRef,
    ) {
        let size = buf.len();
        let mut wait = SendWait {
            waiter: waiter.clone(),
            buf,
            size,
            pos: 0,
        };
        let sock = sockets.get_mut::<tcp::Socket>(self.handle);
        if !send_step(&mut *sock, &mut wait) {
            self.wait = Wait::Send(wait);
        }
    }

    /// The poll-derived counterpart of the receive, sent, connected and
    /// accept upcalls.
    pub(crate) fn process(
        &mut self,
        sockets: &mut SocketSet<'static>,
    ) -> Option<(SockId, Adapter)> {
        if self.listening {
            return self.process_listener(sockets);
        }
        if self.pending_connect.is_some() {
            match sockets.get::<tcp::Socket>(self.handle).state() {
                tcp::State::Established => {
                    self.connected = true;
                    if let Some(waiter) = self.pending_connect.take() {
                        waiter.post(Completion::ok(0));
                    }
                }
                tcp::State::Closed => {
                    // Refused or reset during the handshake.
                    if let Some(waiter) = self.pending_connect.take() {
                        waiter.post(Completion::err(Error::Protocol));
                    }
                }
                _ => {}
            }
        }
        let sock = sockets.get_mut::<tcp::Socket>(self.handle);
        if sock.state() == tcp::State::Established {
            self.connected = true;
        }
        match core::mem::replace(&mut self.wait, Wait::Idle) {
            Wait::Recv(mut wait) => {
                if sock.recv_queue() > 0 {
                    if !copy_step(&mut *sock, &mut wait) {
                        self.wait = Wait::Recv(wait);
                    }
                } else if self.connected && !sock.may_recv() {
                    // Peer closed while parked; partial fills are
                    // discarded.
                    wait.waiter.post(Completion::ok(0));
                } else {
                    self.wait = Wait::Recv(wait);
                }
            }
            Wait::Send(mut wait) => {
                if !send_step(&mut *sock, &mut wait) {
                    self.wait = Wait::Send(wait);
                }
            }
            other => self.wait = other,
        }

        let level = if sock.recv_queue() > 0 {
            sock.recv_queue() as isize
        } else if self.connected && !sock.may_recv() {
            -1
        } else {
            0
        };
        self.rx_level.store(level, Ordering::Relaxed);
        if level != 0 && matches!(self.wait, Wait::Idle) {
            if let Some(pw) = self.poll_waiter.take() {
                pw.post(Completion::ok(0));
            }
        }
        None
    }

    fn process_listener(
        &mut self,
        sockets: &mut SocketSet<'static>,
    ) -> Option<(SockId, Adapter)> {
        if self.accept_pcb.is_some() {
            return None;
        }
        if sockets.get::<tcp::Socket>(self.handle).state() != tcp::State::Established {
            return None;
        }
        // Handshake done on the listening handle: park it in the accept
        // slot. Until accept installs a fresh listener, further SYNs to
        // this port are answered with RST.
        self.accept_pcb = Some(self.handle);
        if let Wait::Accept(AcceptWait {
            waiter,
            new_id,
            new_level,
        }) = core::mem::replace(&mut self.wait, Wait::Idle)
        {
            match self.complete_accept(sockets, new_id, new_level) {
                Ok((adapter, remote)) => {
                    waiter.post(Completion {
                        res: Ok(0),
                        remote: Some(remote),
                    });
                    return Some((new_id, adapter));
                }
                Err(e) => {
                    waiter.post(Completion::err(e));
                }
            }
        } else {
            self.rx_level.store(1, Ordering::Relaxed);
            if let Some(pw) = self.poll_waiter.take() {
                pw.post(Completion::ok(0));
            }
        }
        None
    }

    pub(crate) fn poll_register(&mut self, waiter: Arc<Rendezvous>) -> bool {
        if self.rx_level.load(Ordering::Relaxed) != 0 {
            return true;
        }
        self.poll_waiter = Some(waiter);
        false
    }

    pub(crate) fn poll_clear(&mut self) {
        self.poll_waiter = None;
    }
}
