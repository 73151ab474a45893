//! In-process endpoint implementation
//!
//! A [`MemBus`] stands in for a multicast segment: every endpoint created
//! from it gets a synthetic unicast address, and group sends fan out to
//! all endpoints that joined in receive mode. Deterministic and
//! socket-free, which is what the end-to-end tests and benches run on.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::constants::RECV_POLL;
use crate::error::{MoldError, Result};
use crate::transport::McastEndpoint;

type Datagram = (Vec<u8>, SocketAddr);

struct BusInner {
    members: Mutex<HashMap<SocketAddr, Sender<Datagram>>>,
    group: Mutex<Vec<SocketAddr>>,
    next_port: AtomicU16,
}

/// An in-process network segment endpoints attach to
#[derive(Clone)]
pub struct MemBus {
    inner: Arc<BusInner>,
}

impl MemBus {
    /// New empty segment
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                members: Mutex::new(HashMap::new()),
                group: Mutex::new(Vec::new()),
                next_port: AtomicU16::new(40_000),
            }),
        }
    }

    /// Attach a new endpoint with its own synthetic address
    pub fn endpoint(&self) -> MemEndpoint {
        let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let (tx, rx) = unbounded();
        self.inner.members.lock().insert(addr, tx);
        MemEndpoint {
            bus: Arc::clone(&self.inner),
            addr,
            rx,
            open: false,
            sender_mode: false,
        }
    }
}

impl Default for MemBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint on a [`MemBus`]
pub struct MemEndpoint {
    bus: Arc<BusInner>,
    addr: SocketAddr,
    rx: Receiver<Datagram>,
    open: bool,
    sender_mode: bool,
}

impl MemEndpoint {
    /// The synthetic unicast address of this endpoint
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn deliver(&self, to: SocketAddr, datagram: Datagram) {
        // a vanished member is indistinguishable from packet loss
        if let Some(tx) = self.bus.members.lock().get(&to) {
            let _ = tx.send(datagram);
        }
    }
}

impl McastEndpoint for MemEndpoint {
    fn open_recv(&mut self, _group: Ipv4Addr, _port: u16, _iface: Option<Ipv4Addr>) -> Result<()> {
        if self.open {
            return Err(MoldError::AlreadyOpen);
        }
        self.bus.group.lock().push(self.addr);
        self.open = true;
        Ok(())
    }

    fn open_send(
        &mut self,
        _group: Ipv4Addr,
        _port: u16,
        _loopback: bool,
        _iface: Option<Ipv4Addr>,
    ) -> Result<()> {
        if self.open {
            return Err(MoldError::AlreadyOpen);
        }
        self.open = true;
        self.sender_mode = true;
        Ok(())
    }

    fn send(&self, buf: &[u8]) -> Result<usize> {
        if !self.open {
            return Err(MoldError::Closed);
        }
        if !self.sender_mode {
            return Err(MoldError::WrongMode);
        }
        let listeners: Vec<SocketAddr> = self.bus.group.lock().clone();
        for to in listeners {
            self.deliver(to, (buf.to_vec(), self.addr));
        }
        Ok(buf.len())
    }

    fn send_to(&self, buf: &[u8], dst: SocketAddr) -> Result<usize> {
        if !self.open {
            return Err(MoldError::Closed);
        }
        self.deliver(dst, (buf.to_vec(), self.addr));
        Ok(buf.len())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        if !self.open {
            return Err(MoldError::Closed);
        }
        match self.rx.recv_timeout(RECV_POLL) {
            Ok((bytes, from)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(Some((n, from)))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(MoldError::Closed),
        }
    }

    fn close(&mut self) -> Result<()> {
        if !self.open {
            return Err(MoldError::Closed);
        }
        self.open = false;
        self.bus.members.lock().remove(&self.addr);
        self.bus.group.lock().retain(|a| *a != self.addr);
        Ok(())
    }
}

impl Drop for MemEndpoint {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);

    #[test]
    fn test_group_send_reaches_all_receivers() {
        let bus = MemBus::new();
        let mut tx = bus.endpoint();
        let mut rx1 = bus.endpoint();
        let mut rx2 = bus.endpoint();
        tx.open_send(GROUP, 5858, false, None).unwrap();
        rx1.open_recv(GROUP, 5858, None).unwrap();
        rx2.open_recv(GROUP, 5858, None).unwrap();

        tx.send(b"tick").unwrap();
        let mut buf = [0u8; 16];
        for rx in [&rx1, &rx2] {
            let (n, from) = rx.recv(&mut buf).unwrap().unwrap();
            assert_eq!(&buf[..n], b"tick");
            assert_eq!(from, tx.local_addr());
        }
    }

    #[test]
    fn test_unicast_routes_to_one_member() {
        let bus = MemBus::new();
        let mut a = bus.endpoint();
        let mut b = bus.endpoint();
        a.open_recv(GROUP, 5858, None).unwrap();
        b.open_send(GROUP, 5858, false, None).unwrap();

        b.send_to(b"nak", a.local_addr()).unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = a.recv(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"nak");
        assert_eq!(from, b.local_addr());
    }

    #[test]
    fn test_recv_times_out_quietly() {
        let bus = MemBus::new();
        let mut a = bus.endpoint();
        a.open_recv(GROUP, 5858, None).unwrap();
        let mut buf = [0u8; 16];
        assert!(a.recv(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_receive_endpoint_cannot_group_send() {
        let bus = MemBus::new();
        let mut a = bus.endpoint();
        a.open_recv(GROUP, 5858, None).unwrap();
        assert!(matches!(a.send(b"x"), Err(MoldError::WrongMode)));
    }
}
