//! The IP-stack execution context.
//!
//! Every [`Stack`] owns one thread that drives a smoltcp interface. All
//! protocol state (the smoltcp sockets, the per-socket adapters, the
//! port tables) is owned by that thread. User threads reach it only by
//! posting closures and parking on a rendezvous until the closure (or a
//! later stack event) completes the call, so nothing here needs a lock.
//!
//! The adapter completion logic that a callback-driven stack would run
//! from its upcalls runs here as a scan over the adapters after every
//! interface poll.

pub(crate) mod port;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use smoltcp::iface::{Config, Interface, PollResult, SocketHandle, SocketSet};
use smoltcp::phy::{Device, Loopback, Medium};
use smoltcp::socket::tcp;
use smoltcp::time::Instant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr};

use crate::error::Error;
use crate::rendezvous::{Completion, Rendezvous};
use crate::socket::datagram::DatagramAdapter;
use crate::socket::raw::RawAdapter;
use crate::socket::stream::StreamAdapter;
use port::PortManager;

pub(crate) type SockId = u64;

type StackCall = Box<dyn FnOnce(&mut StackCtx<'_>) + Send>;

/// How long the stack thread sleeps when smoltcp schedules no timer.
/// Bounds the latency of device-originated packets on real devices.
const IDLE_POLL: Duration = Duration::from_millis(20);

/// What a posted closure may touch. The device itself is absent: only
/// the poll loop drives it.
pub(crate) struct StackCtx<'a> {
    pub iface: &'a mut Interface,
    pub sockets: &'a mut SocketSet<'static>,
    pub adapters: &'a mut HashMap<SockId, Adapter>,
    pub ports: &'a mut PortManager,
    /// TCP handles whose close is underway; removed once `Closed`.
    pub reap: &'a mut Vec<SocketHandle>,
}

/// Per-socket state, tagged by protocol. Lives exclusively on the stack
/// thread.
#[derive(Debug)]
pub(crate) enum Adapter {
    Datagram(DatagramAdapter),
    Stream(StreamAdapter),
    Raw(RawAdapter),
}

/// Interface parameters for [`Stack::spawn`].
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub hardware_addr: HardwareAddress,
    pub addrs: Vec<IpCidr>,
}

impl StackConfig {
    /// The loopback profile: no hardware address, `127.0.0.1/8`.
    pub fn loopback() -> Self {
        Self {
            hardware_addr: HardwareAddress::Ip,
            addrs: vec![IpCidr::new(IpAddress::v4(127, 0, 0, 1), 8)],
        }
    }
}

/// Handle to one running stack context.
#[derive(Debug)]
pub struct Stack {
    calls: Sender<StackCall>,
    next_id: AtomicU64,
}

impl Stack {
    /// Spawns a stack thread over `device`.
    pub fn spawn<D>(mut device: D, config: StackConfig) -> Arc<Self>
    where
        D: Device + Send + 'static,
    {
        let (calls, queue) = mpsc::channel();
        let stack = Arc::new(Self {
            calls,
            next_id: AtomicU64::new(1),
        });
        thread::Builder::new()
            .name("smolsock-stack".into())
            .spawn(move || {
                let iface_config = Config::new(config.hardware_addr);
                let mut iface = Interface::new(iface_config, &mut device, Instant::now());
                iface.update_ip_addrs(|addrs| {
                    for cidr in &config.addrs {
                        if addrs.push(*cidr).is_err() {
                            log::warn!("interface address table full, dropping {cidr}");
                        }
                    }
                });
                run(device, iface, queue);
            })
            .expect("failed to spawn the stack thread");
        stack
    }

    /// The default profile: smoltcp's loopback device on `127.0.0.1/8`.
    pub fn loopback() -> Arc<Self> {
        Self::spawn(Loopback::new(Medium::Ip), StackConfig::loopback())
    }

    pub(crate) fn alloc_id(&self) -> SockId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Posts `f` to the stack thread and parks until the call
    /// completes. `f` must either post to the rendezvous before
    /// returning or stash it in a wait slot for a later stack event.
    pub(crate) fn call_with<F>(&self, f: F) -> Completion
    where
        F: FnOnce(&mut StackCtx<'_>, &Arc<Rendezvous>) + Send + 'static,
    {
        let waiter = Rendezvous::new();
        let theirs = waiter.clone();
        let call: StackCall = Box::new(move |ctx| f(ctx, &theirs));
        if self.calls.send(call).is_err() {
            // The stack thread is gone; nothing will ever resume us.
            return Completion::err(Error::Protocol);
        }
        waiter.wait()
    }
}

fn run<D: Device>(mut device: D, mut iface: Interface, queue: Receiver<StackCall>) {
    let mut sockets = SocketSet::new(Vec::new());
    let mut adapters: HashMap<SockId, Adapter> = HashMap::new();
    let mut ports = PortManager::new();
    let mut reap: Vec<SocketHandle> = Vec::new();

    log::debug!("stack thread up");
    loop {
        let timeout = iface
            .poll_delay(Instant::now(), &sockets)
            .map(Duration::from)
            .unwrap_or(IDLE_POLL)
            .min(IDLE_POLL);
        // One closure per cycle: every caller observes the interface
        // fully settled with respect to all earlier calls.
        match queue.recv_timeout(timeout) {
            Ok(call) => {
                let mut ctx = StackCtx {
                    iface: &mut iface,
                    sockets: &mut sockets,
                    adapters: &mut adapters,
                    ports: &mut ports,
                    reap: &mut reap,
                };
                call(&mut ctx);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        // Drive the interface until it settles, firing the derived
        // socket events after every pass. The event scan itself can
        // queue new egress (a send chunk, a reopened receive window),
        // so quiescence takes two quiet passes in a row.
        let mut quiet = false;
        loop {
            let result = iface.poll(Instant::now(), &mut device, &mut sockets);
            process_events(&mut sockets, &mut adapters);
            if matches!(result, PollResult::None) {
                if quiet {
                    break;
                }
                quiet = true;
            } else {
                quiet = false;
            }
        }
        reap_closed(&mut sockets, &mut reap);
    }
    log::debug!("stack thread down");
}

/// The poll-derived counterpart of the stack's receive / sent / accept /
/// connected upcalls.
fn process_events(sockets: &mut SocketSet<'static>, adapters: &mut HashMap<SockId, Adapter>) {
    let mut accepted: Vec<(SockId, Adapter)> = Vec::new();
    for adapter in adapters.values_mut() {
        match adapter {
            Adapter::Datagram(a) => a.process(sockets),
            Adapter::Raw(a) => a.process(sockets),
            Adapter::Stream(a) => {
                if let Some(entry) = a.process(sockets) {
                    accepted.push(entry);
                }
            }
        }
    }
    for (id, adapter) in accepted {
        adapters.insert(id, adapter);
    }
}

/// Removes closing TCP sockets once their state machine has fully shut
/// down, so FIN/RST exchanges actually reach the peer first.
fn reap_closed(sockets: &mut SocketSet<'static>, reap: &mut Vec<SocketHandle>) {
    reap.retain(|&handle| {
        let closed = sockets.get::<tcp::Socket>(handle).state() == tcp::State::Closed;
        if closed {
            sockets.remove(handle);
        }
        !closed
    });
}
