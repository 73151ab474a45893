//! Subscriber core: receive, gap-detect, request, reassemble
//!
//! [`ClientCore`] is the pure packet-classification state machine; it
//! owns the expected-next-sequence counter and the session binding and
//! turns each received datagram into "messages ready" and "request
//! needed" decisions. [`Client`] drives it from a transport endpoint,
//! dispatching retransmit requests round-robin and surfacing the
//! end-of-session sentinel as a terminal result.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::SubscriberConfig;
use crate::constants::{
    COUNT_END_OF_SESSION, COUNT_HEARTBEAT, HEADER_SIZE, MAX_MESSAGES_PER_PACKET, MAX_REQUEST_COUNT,
    MAX_UDP_SIZE, REQUEST_INTERVAL,
};
use crate::error::{MoldError, Result};
use crate::supervisor::{epoch_secs, RunFlag};
use crate::transport::McastEndpoint;
use crate::wire::{self, Message};

/// Shared subscriber counters, readable while the receive loop runs
#[derive(Debug, Default)]
pub struct ClientStats {
    received: AtomicU64,
    errors: AtomicU64,
    requests: AtomicU64,
    heartbeats: AtomicU64,
    next_seq: AtomicU64,
    last_recv: AtomicU64,
    last_block_seq: AtomicU64,
    last_block_len: AtomicU64,
}

/// Point-in-time copy of [`ClientStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStatsSnapshot {
    /// Datagrams received, including dropped ones
    pub received: u64,
    /// Datagrams counted out as malformed, mis-sessioned, or miscounted
    pub errors: u64,
    /// Retransmit requests sent
    pub requests: u64,
    /// Heartbeats observed
    pub heartbeats: u64,
    /// Next sequence the subscriber expects
    pub next_seq: u64,
    /// Epoch seconds of the most recent receive
    pub last_recv: u64,
    /// First sequence of the most recent delivered batch
    pub last_block_seq: u64,
    /// Size of the most recent delivered batch
    pub last_block_len: u64,
}

impl ClientStats {
    fn mark_recv(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.last_recv.store(epoch_secs(), Ordering::Relaxed);
    }

    fn count_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Epoch seconds of the most recent receive; the stall timer's input
    pub fn last_recv_secs(&self) -> u64 {
        self.last_recv.load(Ordering::Relaxed)
    }

    /// Copy the counters out
    pub fn snapshot(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            next_seq: self.next_seq.load(Ordering::Relaxed),
            last_recv: self.last_recv.load(Ordering::Relaxed),
            last_block_seq: self.last_block_seq.load(Ordering::Relaxed),
            last_block_len: self.last_block_len.load(Ordering::Relaxed),
        }
    }
}

/// What one datagram produced
#[derive(Debug, Default)]
pub struct PacketOutcome {
    /// Newly in-order messages for the application, if any
    pub ready: Option<Vec<Message>>,
    /// Encoded retransmit request to dispatch, if a gap was detected and
    /// the rate-limit window had elapsed
    pub request: Option<[u8; HEADER_SIZE]>,
    /// The packet was the end-of-session sentinel
    pub end_of_session: bool,
}

/// Transport-independent subscriber state machine
pub struct ClientCore {
    expected_seq: u64,
    session: Option<String>,
    last_request: Option<Instant>,
    stats: Arc<ClientStats>,
}

impl ClientCore {
    /// Start expecting `next_seq` (clamped to the 1-based floor)
    pub fn new(next_seq: u64, stats: Arc<ClientStats>) -> Self {
        let expected_seq = next_seq.max(1);
        stats.next_seq.store(expected_seq, Ordering::Relaxed);
        Self {
            expected_seq,
            session: None,
            last_request: None,
            stats,
        }
    }

    /// Next sequence the subscriber will deliver
    pub fn expected_seq(&self) -> u64 {
        self.expected_seq
    }

    /// Session tag this stream bound to, once the first packet arrived
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Classify one received datagram.
    ///
    /// Errors mean the packet was counted and dropped; the stream state
    /// is unchanged and the caller continues receiving.
    pub fn on_packet(&mut self, data: &[u8]) -> Result<PacketOutcome> {
        self.on_packet_at(data, Instant::now())
    }

    pub(crate) fn on_packet_at(&mut self, data: &[u8], now: Instant) -> Result<PacketOutcome> {
        let head = wire::decode_header(data).inspect_err(|_| self.stats.count_error())?;
        let count = head.message_count;
        if count >= MAX_MESSAGES_PER_PACKET && count != COUNT_END_OF_SESSION {
            self.stats.count_error();
            return Err(MoldError::InvalidMessageCount(count));
        }
        match &self.session {
            None => {
                info!("bound to session {:?}", head.session);
                self.session = Some(head.session.clone());
            }
            Some(bound) if *bound != head.session => {
                self.stats.count_error();
                return Err(MoldError::SessionMismatch {
                    bound: bound.clone(),
                    got: head.session,
                });
            }
            _ => {}
        }

        let mut outcome = PacketOutcome::default();
        if head.sequence > self.expected_seq {
            let window_open = self
                .last_request
                .is_none_or(|at| now.duration_since(at) >= REQUEST_INTERVAL);
            if window_open {
                let gap = head.sequence - self.expected_seq;
                let req = gap.min(u64::from(MAX_REQUEST_COUNT)) as u16;
                outcome.request = Some(wire::encode_request(self.expected_seq, req));
                self.last_request = Some(now);
            }
        }

        match count {
            COUNT_END_OF_SESSION => {
                outcome.end_of_session = true;
            }
            COUNT_HEARTBEAT => {
                self.stats.heartbeats.fetch_add(1, Ordering::Relaxed);
            }
            _ if head.sequence != self.expected_seq => {
                // ahead of the stream or already consumed; the gap, if
                // any, is repaired by retransmit rather than buffering
            }
            _ => {
                let msgs =
                    wire::unmarshal(&data[HEADER_SIZE..]).inspect_err(|_| self.stats.count_error())?;
                if msgs.len() != count as usize {
                    self.stats.count_error();
                    return Err(MoldError::InvalidMessageCount(count));
                }
                self.expected_seq += msgs.len() as u64;
                self.stats.next_seq.store(self.expected_seq, Ordering::Relaxed);
                self.stats
                    .last_block_seq
                    .store(head.sequence, Ordering::Relaxed);
                self.stats
                    .last_block_len
                    .store(msgs.len() as u64, Ordering::Relaxed);
                outcome.ready = Some(msgs);
            }
        }
        Ok(outcome)
    }
}

/// Subscriber bound to a transport endpoint
pub struct Client<E: McastEndpoint> {
    endpoint: E,
    core: ClientCore,
    req_servers: Vec<SocketAddr>,
    robin: usize,
    run: RunFlag,
    stats: Arc<ClientStats>,
}

impl<E: McastEndpoint> Client<E> {
    /// Open `endpoint` for the configured group and wire up the core
    pub fn new(mut endpoint: E, cfg: &SubscriberConfig) -> Result<Self> {
        let req_servers = cfg.retransmit_addrs()?;
        endpoint.open_recv(cfg.effective_group(), cfg.port, cfg.interface)?;
        let stats = Arc::new(ClientStats::default());
        stats.last_recv.store(epoch_secs(), Ordering::Relaxed);
        Ok(Self {
            endpoint,
            core: ClientCore::new(cfg.next_sequence, Arc::clone(&stats)),
            req_servers,
            robin: 0,
            run: RunFlag::new(),
            stats,
        })
    }

    /// The flag this client's loops observe
    pub fn run_flag(&self) -> RunFlag {
        self.run.clone()
    }

    /// Shared counters for display and stall detection
    pub fn stats(&self) -> Arc<ClientStats> {
        Arc::clone(&self.stats)
    }

    /// Block until the next in-order batch.
    ///
    /// Returns `Ok(Some(batch))` with at least one message,
    /// `Ok(None)` at end of session or once the run flag flips, and
    /// `Err` only for transport failures. Malformed packets are counted
    /// and skipped here.
    pub fn read(&mut self) -> Result<Option<Vec<Message>>> {
        let mut buf = [0u8; MAX_UDP_SIZE];
        while self.run.is_running() {
            let Some((n, from)) = self.endpoint.recv(&mut buf)? else {
                continue;
            };
            self.stats.mark_recv();
            match self.core.on_packet(&buf[..n]) {
                Err(e) => {
                    debug!("dropped packet from {}: {}", from, e);
                }
                Ok(outcome) => {
                    if self.req_servers.is_empty() {
                        info!("adopting {} as retransmit server", from);
                        self.req_servers.push(from);
                    }
                    if let Some(req) = outcome.request {
                        self.send_request(&req);
                    }
                    if outcome.end_of_session {
                        info!("end of session at sequence {}", self.core.expected_seq());
                        return Ok(None);
                    }
                    if let Some(msgs) = outcome.ready {
                        if !msgs.is_empty() {
                            return Ok(Some(msgs));
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    fn send_request(&mut self, req: &[u8; HEADER_SIZE]) {
        if self.req_servers.is_empty() {
            return;
        }
        let dst = self.req_servers[self.robin];
        self.robin = (self.robin + 1) % self.req_servers.len();
        let sent = self.stats.requests.fetch_add(1, Ordering::Relaxed);
        if sent < 5 {
            info!(
                "requesting retransmit from {} at sequence {}",
                dst,
                self.core.expected_seq()
            );
        }
        if let Err(e) = self.endpoint.send_to(req, dst) {
            warn!("retransmit request to {} failed: {}", dst, e);
        }
    }

    /// Log the counters the way the operators watch them
    pub fn report(&self) {
        let s = self.stats.snapshot();
        info!(
            "recv: {} errors: {} requests: {} heartbeats: {} next seq: {}",
            s.received, s.errors, s.requests, s.heartbeats, s.next_seq
        );
    }

    /// Release the endpoint
    pub fn close(&mut self) -> Result<()> {
        self.run.stop();
        self.endpoint.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_PAYLOAD_SIZE;
    use crate::wire::{encode_header, marshal, Header};
    use std::time::Duration;

    fn core(next_seq: u64) -> ClientCore {
        ClientCore::new(next_seq, Arc::new(ClientStats::default()))
    }

    fn data_packet(session: &str, sequence: u64, payloads: &[&[u8]]) -> Vec<u8> {
        let msgs: Vec<Message> = payloads.iter().map(|p| Message::new(*p)).collect();
        let mut buf = vec![0u8; MAX_UDP_SIZE];
        let (count, written) = marshal(&mut buf[HEADER_SIZE..], &msgs);
        assert_eq!(count, msgs.len());
        let head = Header {
            session: session.to_string(),
            sequence,
            message_count: count as u16,
        };
        encode_header(&head, &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + written);
        buf
    }

    fn header_packet(session: &str, sequence: u64, message_count: u16) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE];
        let head = Header {
            session: session.to_string(),
            sequence,
            message_count,
        };
        encode_header(&head, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_in_order_batch_is_delivered() {
        let mut core = core(1);
        let pkt = data_packet("20180101", 1, &[b"\x41", b"\x42", b"\x43"]);
        let out = core.on_packet(&pkt).unwrap();
        let msgs = out.ready.unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].data, b"\x41");
        assert_eq!(core.expected_seq(), 4);
        assert!(out.request.is_none());
        assert!(!out.end_of_session);
    }

    #[test]
    fn test_heartbeat_delivers_nothing() {
        let mut core = core(1);
        let out = core
            .on_packet(&header_packet("20180101", 1, COUNT_HEARTBEAT))
            .unwrap();
        assert!(out.ready.is_none());
        assert!(out.request.is_none());
        assert_eq!(core.expected_seq(), 1);
    }

    #[test]
    fn test_gap_emits_capped_request() {
        let mut core = core(2);
        let pkt = data_packet("A", 100_000, &[b"x"]);
        let out = core.on_packet(&pkt).unwrap();
        assert!(out.ready.is_none());
        let req = wire::decode_header(&out.request.unwrap()).unwrap();
        assert_eq!(req.session, "");
        assert_eq!(req.sequence, 2);
        assert_eq!(req.message_count, MAX_REQUEST_COUNT);
    }

    #[test]
    fn test_request_rate_limit_window() {
        let mut core = core(1);
        let t0 = Instant::now();
        let gap = data_packet("A", 3, &[b"x"]);
        // gap packets arriving every second for ten seconds
        let mut requests = 0;
        for s in 0..10u64 {
            let out = core
                .on_packet_at(&gap, t0 + Duration::from_secs(s))
                .unwrap();
            if out.request.is_some() {
                requests += 1;
            }
        }
        assert_eq!(requests, 2);
    }

    #[test]
    fn test_session_mismatch_is_counted_and_dropped() {
        let stats = Arc::new(ClientStats::default());
        let mut core = ClientCore::new(1, Arc::clone(&stats));
        core.on_packet(&data_packet("A", 1, &[b"x"])).unwrap();
        let err = core.on_packet(&data_packet("B", 2, &[b"y"])).unwrap_err();
        assert!(matches!(err, MoldError::SessionMismatch { .. }));
        assert_eq!(stats.snapshot().errors, 1);
        assert_eq!(core.expected_seq(), 2);
    }

    #[test]
    fn test_end_of_session_surfaces_once() {
        let mut core = core(1);
        let out = core
            .on_packet(&header_packet("A", 1, COUNT_END_OF_SESSION))
            .unwrap();
        assert!(out.end_of_session);
        assert!(out.ready.is_none());
    }

    #[test]
    fn test_out_of_order_data_is_dropped_not_buffered() {
        let mut core = core(1);
        let out = core.on_packet(&data_packet("A", 3, &[b"z"])).unwrap();
        assert!(out.ready.is_none());
        assert!(out.request.is_some());
        assert_eq!(core.expected_seq(), 1);
        // the packet arrives again after repair and then delivers
        core.on_packet(&data_packet("A", 1, &[b"a", b"b"])).unwrap();
        let out = core.on_packet(&data_packet("A", 3, &[b"z"])).unwrap();
        assert_eq!(out.ready.unwrap()[0].data, b"z");
        assert_eq!(core.expected_seq(), 4);
    }

    #[test]
    fn test_stale_packet_is_ignored() {
        let mut core = core(5);
        let out = core.on_packet(&data_packet("A", 2, &[b"x"])).unwrap();
        assert!(out.ready.is_none());
        assert!(out.request.is_none());
        assert_eq!(core.expected_seq(), 5);
    }

    #[test]
    fn test_invalid_count_is_rejected() {
        let mut core = core(1);
        let err = core
            .on_packet(&header_packet("A", 1, MAX_MESSAGES_PER_PACKET))
            .unwrap_err();
        assert!(matches!(err, MoldError::InvalidMessageCount(_)));
        // session must not have been adopted from a rejected packet
        assert!(core.session().is_none());
    }

    #[test]
    fn test_short_packet_is_rejected() {
        let mut core = core(1);
        let err = core.on_packet(&[0u8; HEADER_SIZE - 1]).unwrap_err();
        assert!(matches!(err, MoldError::MalformedHeader { .. }));
    }

    #[test]
    fn test_count_payload_mismatch_is_rejected() {
        let mut core = core(1);
        // header announces two messages, payload carries one
        let mut pkt = data_packet("A", 1, &[b"only"]);
        pkt[HEADER_SIZE - 2..HEADER_SIZE].copy_from_slice(&2u16.to_be_bytes());
        let err = core.on_packet(&pkt).unwrap_err();
        assert!(matches!(err, MoldError::InvalidMessageCount(_)));
        assert_eq!(core.expected_seq(), 1);
    }

    #[test]
    fn test_first_packet_binds_session() {
        let mut core = core(1);
        core.on_packet(&header_packet("20180101", 1, COUNT_HEARTBEAT))
            .unwrap();
        assert_eq!(core.session(), Some("20180101"));
    }

    #[test]
    fn test_heartbeat_ahead_of_stream_requests_repair() {
        let mut core = core(1);
        let out = core
            .on_packet(&header_packet("A", 4, COUNT_HEARTBEAT))
            .unwrap();
        assert!(out.ready.is_none());
        let req = wire::decode_header(&out.request.unwrap()).unwrap();
        assert_eq!(req.sequence, 1);
        assert_eq!(req.message_count, 3);
    }

    #[test]
    fn test_oversize_payload_area_still_parses() {
        // a full packet right at the wire cap
        let payload = vec![0u8; MAX_PAYLOAD_SIZE - 2];
        let mut core = core(1);
        let pkt = data_packet("A", 1, &[&payload]);
        assert_eq!(pkt.len(), MAX_UDP_SIZE);
        let out = core.on_packet(&pkt).unwrap();
        assert_eq!(out.ready.unwrap()[0].data.len(), payload.len());
    }
}
