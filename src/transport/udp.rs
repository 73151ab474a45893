//! OS-socket endpoint implementation
//!
//! Plain blocking UDP sockets via `socket2` for the multicast options
//! the std API does not expose at bind time. Receive calls carry a short
//! read timeout so the protocol loops can poll their run flag.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::constants::{RECV_BUFFER_SIZE, RECV_POLL, SEND_BUFFER_SIZE};
use crate::error::{MoldError, Result};
use crate::transport::McastEndpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Recv,
    Send,
}

/// Multicast endpoint over a single OS UDP socket.
///
/// The publisher keeps one socket for both the outgoing multicast stream
/// and incoming unicast retransmit requests; the subscriber likewise
/// sends requests from the socket it receives the group on.
pub struct UdpEndpoint {
    socket: Option<UdpSocket>,
    dest: Option<SocketAddr>,
    mode: Option<Mode>,
}

impl UdpEndpoint {
    /// New unopened endpoint
    pub fn new() -> Self {
        Self {
            socket: None,
            dest: None,
            mode: None,
        }
    }

    fn socket(&self) -> Result<&UdpSocket> {
        self.socket.as_ref().ok_or(MoldError::Closed)
    }

    fn raw_socket(&self) -> Result<Socket> {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_read_timeout(Some(RECV_POLL))?;
        Ok(sock)
    }
}

impl Default for UdpEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl McastEndpoint for UdpEndpoint {
    fn open_recv(&mut self, group: Ipv4Addr, port: u16, iface: Option<Ipv4Addr>) -> Result<()> {
        if self.socket.is_some() {
            return Err(MoldError::AlreadyOpen);
        }
        let sock = self.raw_socket()?;
        sock.set_reuse_address(true)?;
        sock.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
        if let Err(e) = sock.set_recv_buffer_size(RECV_BUFFER_SIZE) {
            warn!("could not size receive buffer to {} bytes: {}", RECV_BUFFER_SIZE, e);
        }
        debug!(
            "receive buffer is {} KiB",
            sock.recv_buffer_size().unwrap_or(0) / 1024
        );
        let join_iface = iface.unwrap_or(Ipv4Addr::UNSPECIFIED);
        sock.join_multicast_v4(&group, &join_iface)?;
        info!("joined {} on port {} via {}", group, port, join_iface);
        self.socket = Some(sock.into());
        self.mode = Some(Mode::Recv);
        Ok(())
    }

    fn open_send(
        &mut self,
        group: Ipv4Addr,
        port: u16,
        loopback: bool,
        iface: Option<Ipv4Addr>,
    ) -> Result<()> {
        if self.socket.is_some() {
            return Err(MoldError::AlreadyOpen);
        }
        let sock = self.raw_socket()?;
        // Under loopback a subscriber on this host owns the group port,
        // so bind ephemeral instead.
        let bind_port = if loopback { 0 } else { port };
        sock.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, bind_port)).into())?;
        if let Err(e) = sock.set_send_buffer_size(SEND_BUFFER_SIZE) {
            warn!("could not size send buffer to {} bytes: {}", SEND_BUFFER_SIZE, e);
        }
        debug!(
            "send buffer is {} KiB",
            sock.send_buffer_size().unwrap_or(0) / 1024
        );
        if let Some(ifa) = iface {
            sock.set_multicast_if_v4(&ifa)?;
            info!("multicast egress via {}", ifa);
        }
        sock.set_multicast_loop_v4(loopback)?;
        let socket: UdpSocket = sock.into();
        info!(
            "multicasting to {}:{} from {}",
            group,
            port,
            socket.local_addr()?
        );
        self.socket = Some(socket);
        self.dest = Some(SocketAddr::from((group, port)));
        self.mode = Some(Mode::Send);
        Ok(())
    }

    fn send(&self, buf: &[u8]) -> Result<usize> {
        if self.mode != Some(Mode::Send) {
            return Err(MoldError::WrongMode);
        }
        let dest = self.dest.ok_or(MoldError::Closed)?;
        Ok(self.socket()?.send_to(buf, dest)?)
    }

    fn send_to(&self, buf: &[u8], dst: SocketAddr) -> Result<usize> {
        Ok(self.socket()?.send_to(buf, dst)?)
    }

    fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        match self.socket()?.recv_from(buf) {
            Ok((n, from)) => Ok(Some((n, from))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.socket.take().is_none() {
            return Err(MoldError::Closed);
        }
        self.dest = None;
        self.mode = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Capabilities;

    #[test]
    fn test_unopened_endpoint_refuses_io() {
        let ep = UdpEndpoint::new();
        assert!(matches!(ep.send(b"x"), Err(MoldError::WrongMode)));
        let mut buf = [0u8; 32];
        assert!(matches!(ep.recv(&mut buf), Err(MoldError::Closed)));
    }

    #[test]
    fn test_close_requires_open() {
        let mut ep = UdpEndpoint::new();
        assert!(matches!(ep.close(), Err(MoldError::Closed)));
    }

    #[test]
    fn test_advertises_no_optional_capabilities() {
        assert_eq!(UdpEndpoint::new().capabilities(), Capabilities::default());
    }

    #[test]
    fn test_open_send_is_exclusive() {
        let mut ep = UdpEndpoint::new();
        let group = Ipv4Addr::new(224, 0, 0, 1);
        // loopback mode binds an ephemeral port, safe on any host
        ep.open_send(group, 0, true, None).unwrap();
        assert!(matches!(
            ep.open_send(group, 0, true, None),
            Err(MoldError::AlreadyOpen)
        ));
        ep.close().unwrap();
        assert!(matches!(ep.close(), Err(MoldError::Closed)));
    }
}
