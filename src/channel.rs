//! Generic byte-channel contract and readiness polling.

use crate::error::Error;
use crate::rendezvous::Rendezvous;
use crate::socket::Socket;

/// The byte-channel contract sockets share with other channels in an
/// embedder's event system.
pub trait Channel {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;
    fn write(&mut self, buf: &[u8]) -> Result<usize, Error>;
    /// Non-zero when a read would complete without parking.
    fn size(&self) -> usize;
}

impl Channel for Socket {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        Socket::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        Socket::write(self, buf)
    }

    fn size(&self) -> usize {
        Socket::size(self)
    }
}

/// Waits for readiness on any of a set of sockets.
///
/// The per-socket poll waiter has strictly lower priority than a thread
/// parked in a blocking call: a socket with a primary waiter completes
/// that call instead of waking the poll set.
#[derive(Default)]
pub struct PollSet<'a> {
    sockets: Vec<&'a Socket>,
}

impl<'a> PollSet<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, socket: &'a Socket) -> &mut Self {
        self.sockets.push(socket);
        self
    }

    /// Parks until at least one socket is readable and returns its
    /// index. All sockets must belong to the same stack.
    pub fn wait(&self) -> Result<usize, Error> {
        let Some(&first) = self.sockets.first() else {
            return Err(Error::InvalidArgument);
        };
        if !self.sockets.iter().all(|s| s.same_stack(first)) {
            return Err(Error::InvalidArgument);
        }
        loop {
            let waiter = Rendezvous::new();
            let mut ready = None;
            for (i, socket) in self.sockets.iter().enumerate() {
                if socket.poll_register(&waiter) {
                    ready = Some(i);
                    break;
                }
            }
            if let Some(i) = ready {
                self.clear();
                return Ok(i);
            }
            let _ = waiter.wait();
            self.clear();
            // The readiness mirror is written before the wake, so the
            // woken socket is visible here.
            if let Some(i) = self.sockets.iter().position(|s| s.size() != 0) {
                return Ok(i);
            }
        }
    }

    fn clear(&self) {
        for socket in &self.sockets {
            socket.poll_clear();
        }
    }
}
