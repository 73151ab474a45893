//! Multicast transport abstraction
//!
//! The protocol cores address the network only through [`McastEndpoint`],
//! a capability-typed endpoint: plain unicast send, group send, and
//! blocking receive are always available, while batched (`msend`/`mrecv`)
//! and ring-buffered callback receive exist only on implementations that
//! advertise them. Alternative implementations (raw sockets, ring-buffered
//! capture) slot in without touching the publisher or subscriber code.
//!
//! Two implementations ship with the crate:
//! - [`UdpEndpoint`] over OS sockets, the production transport;
//! - [`MemEndpoint`] over in-process channels, for tests and benches.

use std::net::{Ipv4Addr, SocketAddr};

use crate::error::{MoldError, Result};

pub mod mem;
pub mod udp;

pub use mem::{MemBus, MemEndpoint};
pub use udp::UdpEndpoint;

/// Optional operations an endpoint implementation advertises
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `msend` submits several datagrams in one call
    pub batched_send: bool,
    /// `mrecv` drains several datagrams in one call
    pub batched_recv: bool,
    /// `listen` drives a callback from a receive ring
    pub ring_listen: bool,
}

/// A multicast endpoint as the protocol cores see it.
///
/// An endpoint is opened once, either for receiving from a group
/// ([`open_recv`](Self::open_recv)) or for sending to one
/// ([`open_send`](Self::open_send)). Both modes still support unicast
/// `send_to` and blocking `recv`: the publisher answers retransmit
/// requests on its send endpoint and the subscriber emits them from its
/// receive endpoint.
pub trait McastEndpoint: Send + Sync {
    /// Which optional operations this implementation supports
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Bind the group port, join `group` on `iface` (or the kernel
    /// default), and size the receive buffer generously.
    fn open_recv(&mut self, group: Ipv4Addr, port: u16, iface: Option<Ipv4Addr>) -> Result<()>;

    /// Bind for sending to `(group, port)`, select the outgoing
    /// interface, and configure the loopback flag.
    fn open_send(
        &mut self,
        group: Ipv4Addr,
        port: u16,
        loopback: bool,
        iface: Option<Ipv4Addr>,
    ) -> Result<()>;

    /// Send one datagram to the configured group destination.
    ///
    /// Only valid on a send-mode endpoint. The datagram is queued whole
    /// or an error returns; there are no partial sends.
    fn send(&self, buf: &[u8]) -> Result<usize>;

    /// Send one datagram unicast to `dst`.
    fn send_to(&self, buf: &[u8], dst: SocketAddr) -> Result<usize>;

    /// Receive one datagram, blocking at most the poll interval.
    ///
    /// Returns `Ok(None)` when the poll interval elapsed without data so
    /// callers can observe their run flag.
    fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>>;

    /// Release the underlying resources; further operations fail with
    /// [`MoldError::Closed`].
    fn close(&mut self) -> Result<()>;

    /// Batched group send. Only when `capabilities().batched_send`.
    fn msend(&self, _bufs: &[&[u8]]) -> Result<usize> {
        Err(MoldError::CapabilityUnsupported)
    }

    /// Batched receive. Only when `capabilities().batched_recv`.
    fn mrecv(&self) -> Result<(Vec<Vec<u8>>, SocketAddr)> {
        Err(MoldError::CapabilityUnsupported)
    }

    /// Callback-driven receive from a packet ring. Only when
    /// `capabilities().ring_listen`.
    fn listen(&self, _cb: &mut dyn FnMut(&[u8], SocketAddr)) -> Result<()> {
        Err(MoldError::CapabilityUnsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;

    impl McastEndpoint for Bare {
        fn open_recv(&mut self, _: Ipv4Addr, _: u16, _: Option<Ipv4Addr>) -> Result<()> {
            Ok(())
        }
        fn open_send(&mut self, _: Ipv4Addr, _: u16, _: bool, _: Option<Ipv4Addr>) -> Result<()> {
            Ok(())
        }
        fn send(&self, buf: &[u8]) -> Result<usize> {
            Ok(buf.len())
        }
        fn send_to(&self, buf: &[u8], _: SocketAddr) -> Result<usize> {
            Ok(buf.len())
        }
        fn recv(&self, _: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
            Ok(None)
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_optional_operations_default_to_unsupported() {
        let ep = Bare;
        assert_eq!(ep.capabilities(), Capabilities::default());
        assert!(matches!(
            ep.msend(&[]),
            Err(MoldError::CapabilityUnsupported)
        ));
        assert!(matches!(ep.mrecv(), Err(MoldError::CapabilityUnsupported)));
        assert!(matches!(
            ep.listen(&mut |_, _| {}),
            Err(MoldError::CapabilityUnsupported)
        ));
    }
}
