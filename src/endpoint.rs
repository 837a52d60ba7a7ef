//! IPv4 endpoint type shared by the whole call surface.

use core::fmt;
use core::str::FromStr;

use smoltcp::wire::{IpAddress, IpEndpoint, IpListenEndpoint, Ipv4Address};

use crate::error::Error;

/// An IPv4 address and port pair, the only address family this layer
/// speaks. Port `0` on a local address means "any port"; the address
/// `0.0.0.0` means "any interface address".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InetAddr {
    pub addr: Ipv4Address,
    pub port: u16,
}

impl InetAddr {
    pub const fn new(addr: Ipv4Address, port: u16) -> Self {
        Self { addr, port }
    }

    pub const fn v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self {
            addr: Ipv4Address::new(a, b, c, d),
            port,
        }
    }

    /// The local half of a bind/listen call, with `0.0.0.0` mapped to
    /// the wildcard.
    pub(crate) fn listen_endpoint(&self) -> IpListenEndpoint {
        IpListenEndpoint {
            addr: if self.addr.is_unspecified() {
                None
            } else {
                Some(IpAddress::Ipv4(self.addr))
            },
            port: self.port,
        }
    }
}

impl From<InetAddr> for IpEndpoint {
    fn from(a: InetAddr) -> Self {
        IpEndpoint::new(IpAddress::Ipv4(a.addr), a.port)
    }
}

impl TryFrom<IpEndpoint> for InetAddr {
    type Error = Error;

    fn try_from(ep: IpEndpoint) -> Result<Self, Error> {
        match ep.addr {
            IpAddress::Ipv4(addr) => Ok(Self {
                addr,
                port: ep.port,
            }),
            #[allow(unreachable_patterns)]
            _ => Err(Error::InvalidArgument),
        }
    }
}

impl fmt::Display for InetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl FromStr for InetAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (ip, port) = s.rsplit_once(':').ok_or(Error::InvalidArgument)?;
        let addr: core::net::Ipv4Addr = ip.parse().map_err(|_| Error::InvalidArgument)?;
        let port = port.parse::<u16>().map_err(|_| Error::InvalidArgument)?;
        Ok(Self {
            addr: Ipv4Address::from(addr),
            port,
        })
    }
}
