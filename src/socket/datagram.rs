//! Datagram (UDP) adapter: the completion logic run on the stack
//! thread.
//!
//! At most one inbound packet is held per socket. A packet arriving
//! while the slot is occupied is received and dropped; datagram
//! boundaries are preserved and oversize reads truncate silently.

use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

use smoltcp::iface::{SocketHandle, SocketSet};
use smoltcp::socket::udp;
use smoltcp::wire::IpEndpoint;

use crate::counters;
use crate::endpoint::InetAddr;
use crate::error::Error;
use crate::rendezvous::{Completion, Rendezvous};
use crate::stack::port::{PortManager, PortProto};
use crate::stack::{Adapter, SockId, StackCtx};

use super::{UserMut, UserRef};

pub(crate) const UDP_PACKET_SLOTS: usize = 16;
pub(crate) const UDP_BUF_SIZE: usize = 16 * 1024;

#[derive(Debug)]
pub(crate) struct DatagramAdapter {
    id: SockId,
    handle: SocketHandle,
    bound_port: Option<u16>,
    /// Default destination installed by `connect`.
    remote: Option<IpEndpoint>,
    /// At most one inbound packet with its source address.
    held: Option<(Vec<u8>, InetAddr)>,
    wait: Option<RecvWait>,
    poll_waiter: Option<Arc<Rendezvous>>,
    rx_level: Arc<AtomicIsize>,
}

#[derive(Debug)]
struct RecvWait {
    waiter: Arc<Rendezvous>,
    buf: UserMut,
}

/// Copies the packet into the parked reader's buffer and builds its
/// completion.
fn copy_resume(packet: &[u8], from: InetAddr, mut buf: UserMut) -> Completion {
    let n = packet.len().min(buf.len());
    // SAFETY: the reading thread stays parked until this completion is
    // posted; nothing else aliases its buffer.
    unsafe {
        buf.slice_mut()[..n].copy_from_slice(&packet[..n]);
    }
    counters::registry().udp_rx_bytes.add(n as u64);
    Completion {
        res: Ok(n),
        remote: Some(from),
    }
}

impl DatagramAdapter {
    pub(crate) fn open(
        ctx: &mut StackCtx<'_>,
        id: SockId,
        rx_level: Arc<AtomicIsize>,
    ) -> Result<(), Error> {
        let rx = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; UDP_PACKET_SLOTS],
            vec![0; UDP_BUF_SIZE],
        );
        let tx = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; UDP_PACKET_SLOTS],
            vec![0; UDP_BUF_SIZE],
        );
        let handle = ctx.sockets.add(udp::Socket::new(rx, tx));
        ctx.adapters.insert(
            id,
            Adapter::Datagram(Self {
                id,
                handle,
                bound_port: None,
                remote: None,
                held: None,
                wait: None,
                poll_waiter: None,
                rx_level,
            }),
        );
        Ok(())
    }

    pub(crate) fn close(self, sockets: &mut SocketSet<'static>, ports: &mut PortManager) {
        sockets.remove(self.handle);
        if let Some(port) = self.bound_port {
            ports.release(PortProto::Udp, port);
        }
    }

    pub(crate) fn bind(
        &mut self,
        sockets: &mut SocketSet<'_>,
        ports: &mut PortManager,
        local: InetAddr,
    ) -> Result<(), Error> {
        ports.bind(PortProto::Udp, local.port, self.id)?;
        let sock = sockets.get_mut::<udp::Socket>(self.handle);
        match sock.bind(local.listen_endpoint()) {
            Ok(()) => {
                self.bound_port = Some(local.port);
                Ok(())
            }
            Err(_) => {
                ports.release(PortProto::Udp, local.port);
                Err(Error::Protocol)
            }
        }
    }

    /// Installs the default remote; binds an ephemeral port first when
    /// the socket is still unbound.
    pub(crate) fn connect(
        &mut self,
        sockets: &mut SocketSet<'_>,
        ports: &mut PortManager,
        remote: InetAddr,
    ) -> Result<(), Error> {
        if self.bound_port.is_none() {
            self.bind_ephemeral(sockets, ports)?;
        }
        self.remote = Some(remote.into());
        Ok(())
    }

    fn bind_ephemeral(
        &mut self,
        sockets: &mut SocketSet<'_>,
        ports: &mut PortManager,
    ) -> Result<(), Error> {
        let port = ports.ephemeral(PortProto::Udp, self.id)?;
        let sock = sockets.get_mut::<udp::Socket>(self.handle);
        if sock.bind(port).is_err() {
            ports.release(PortProto::Udp, port);
            return Err(Error::Protocol);
        }
        self.bound_port = Some(port);
        Ok(())
    }

    pub(crate) fn send_to(
        &mut self,
        sockets: &mut SocketSet<'_>,
        ports: &mut PortManager,
        buf: UserRef,
        remote: Option<InetAddr>,
    ) -> Completion {
        if self.bound_port.is_none() {
            if let Err(e) = self.bind_ephemeral(sockets, ports) {
                return Completion::err(e);
            }
        }
        let Some(dst) = remote.map(IpEndpoint::from).or(self.remote) else {
            // No destination and no prior connect.
            return Completion::err(Error::Protocol);
        };
        let sock = sockets.get_mut::<udp::Socket>(self.handle);
        // SAFETY: the sending thread stays parked until this completion
        // is posted.
        let data = unsafe { buf.slice() };
        match sock.send_slice(data, dst) {
            Ok(()) => {
                counters::registry().udp_tx_bytes.add(data.len() as u64);
                Completion::ok(data.len())
            }
            Err(udp::SendError::BufferFull) => Completion::err(Error::AllocationFailure),
            Err(udp::SendError::Unaddressable) => Completion::err(Error::Protocol),
        }
    }

    pub(crate) fn recv_from(&mut self, waiter: &Arc<Rendezvous>, buf: UserMut) {
        match self.held.take() {
            Some((packet, from)) => {
                self.rx_level.store(0, Ordering::Relaxed);
                waiter.post(copy_resume(&packet, from, buf));
            }
            None => {
                // Resumed by the inbound scan once a packet arrives.
                self.wait = Some(RecvWait {
                    waiter: waiter.clone(),
                    buf,
                });
            }
        }
    }

    /// The inbound "callback": drains everything the ring received this
    /// poll. First packet feeds the parked reader or the held slot;
    /// the rest are dropped.
    pub(crate) fn process(&mut self, sockets: &mut SocketSet<'_>) {
        let sock = sockets.get_mut::<udp::Socket>(self.handle);
        while sock.can_recv() {
            let (payload, meta) = match sock.recv() {
                Ok(r) => r,
                Err(_) => break,
            };
            let Ok(from) = InetAddr::try_from(meta.endpoint) else {
                continue;
            };
            if let Some(wait) = self.wait.take() {
                wait.waiter.post(copy_resume(payload, from, wait.buf));
            } else if self.held.is_none() {
                self.rx_level.store(payload.len() as isize, Ordering::Relaxed);
                self.held = Some((payload.to_vec(), from));
                if let Some(pw) = self.poll_waiter.take() {
                    pw.post(Completion::ok(0));
                }
            }
            // else: slot occupied, the packet is dropped.
        }
    }

    pub(crate) fn poll_register(&mut self, waiter: Arc<Rendezvous>) -> bool {
        if self.held.is_some() {
            return true;
        }
        self.poll_waiter = Some(waiter);
        false
    }

    pub(crate) fn poll_clear(&mut self) {
        self.poll_waiter = None;
    }
}
