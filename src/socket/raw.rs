//! Raw (ICMP) adapter.
//!
//! Send wraps the caller's ICMP payload in an IPv4 header, the way the
//! raw layer of the stack allocates at the IP level; receive delivers
//! the whole IP packet and preserves the source address (no port).
//! Held-slot semantics match the datagram adapter.

use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

use smoltcp::iface::{Interface, SocketHandle, SocketSet};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::socket::raw;
use smoltcp::wire::{IpProtocol, IpVersion, Ipv4Packet, Ipv4Repr};

use crate::counters;
use crate::endpoint::InetAddr;
use crate::error::Error;
use crate::rendezvous::{Completion, Rendezvous};
use crate::stack::{Adapter, SockId, StackCtx};

use super::{UserMut, UserRef};

pub(crate) const RAW_PACKET_SLOTS: usize = 8;
pub(crate) const RAW_BUF_SIZE: usize = 8 * 1024;

const HOP_LIMIT: u8 = 64;

#[derive(Debug)]
pub(crate) struct RawAdapter {
    handle: SocketHandle,
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

fn copy_resume(packet: &[u8], from: InetAddr, mut buf: UserMut) -> Completion {
    let n = packet.len().min(buf.len());
    // SAFETY: the reading thread stays parked until this completion is
    // posted; nothing else aliases its buffer.
    unsafe {
        buf.slice_mut()[..n].copy_from_slice(&packet[..n]);
    }
    counters::registry().raw_rx_bytes.add(n as u64);
    Completion {
        res: Ok(n),
        remote: Some(from),
    }
}

impl RawAdapter {
    pub(crate) fn open(
        ctx: &mut StackCtx<'_>,
        id: SockId,
        rx_level: Arc<AtomicIsize>,
    ) -> Result<(), Error> {
        let rx = raw::PacketBuffer::new(
            vec![raw::PacketMetadata::EMPTY; RAW_PACKET_SLOTS],
            vec![0; RAW_BUF_SIZE],
        );
        let tx = raw::PacketBuffer::new(
            vec![raw::PacketMetadata::EMPTY; RAW_PACKET_SLOTS],
            vec![0; RAW_BUF_SIZE],
        );
        let socket = raw::Socket::new(IpVersion::Ipv4, IpProtocol::Icmp, rx, tx);
        let handle = ctx.sockets.add(socket);
        ctx.adapters.insert(
            id,
            Adapter::Raw(Self {
                handle,
                held: None,
                wait: None,
                poll_waiter: None,
                rx_level,
            }),
        );
        Ok(())
    }

    pub(crate) fn close(self, sockets: &mut SocketSet<'static>) {
        sockets.remove(self.handle);
    }

    pub(crate) fn send_to(
        &mut self,
        sockets: &mut SocketSet<'_>,
        iface: &Interface,
        buf: UserRef,
        remote: InetAddr,
    ) -> Completion {
        let Some(src) = iface.ipv4_addr() else {
            return Completion::err(Error::Protocol);
        };
        // SAFETY: the sending thread stays parked until this completion
        // is posted.
        let payload = unsafe { buf.slice() };
        let repr = Ipv4Repr {
            src_addr: src,
            dst_addr: remote.addr,
            next_header: IpProtocol::Icmp,
            payload_len: payload.len(),
            hop_limit: HOP_LIMIT,
        };
        let mut frame = vec![0u8; repr.buffer_len() + payload.len()];
        let mut packet = Ipv4Packet::new_unchecked(&mut frame[..]);
        repr.emit(&mut packet, &ChecksumCapabilities::default());
        packet.payload_mut().copy_from_slice(payload);

        let sock = sockets.get_mut::<raw::Socket>(self.handle);
        match sock.send_slice(&frame) {
            Ok(()) => {
                counters::registry().raw_tx_bytes.add(payload.len() as u64);
                Completion::ok(payload.len())
            }
            Err(_) => Completion::err(Error::AllocationFailure),
        }
    }

    pub(crate) fn recv_from(&mut self, waiter: &Arc<Rendezvous>, buf: UserMut) {
        match self.held.take() {
            Some((packet, from)) => {
                self.rx_level.store(0, Ordering::Relaxed);
                waiter.post(copy_resume(&packet, from, buf));
            }
            None => {
                self.wait = Some(RecvWait {
                    waiter: waiter.clone(),
                    buf,
                });
            }
        }
    }

    /// The inbound "callback". Every consumed packet is acknowledged to
    /// the ring whether delivered, held or dropped.
    pub(crate) fn process(&mut self, sockets: &mut SocketSet<'_>) {
        let sock = sockets.get_mut::<raw::Socket>(self.handle);
        while sock.can_recv() {
            let packet = match sock.recv() {
                Ok(p) => p,
                Err(_) => break,
            };
            let Ok(ip) = Ipv4Packet::new_checked(packet) else {
                continue;
            };
            let from = InetAddr::new(ip.src_addr(), 0);
            if let Some(wait) = self.wait.take() {
                wait.waiter.post(copy_resume(packet, from, wait.buf));
            } else if self.held.is_none() {
                self.rx_level.store(packet.len() as isize, Ordering::Relaxed);
                self.held = Some((packet.to_vec(), from));
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
