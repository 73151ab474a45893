//! Publisher core: paced multicast transmission and retransmit service
//!
//! The [`Server`] owns the authoritative message log and the current
//! send sequence and runs two cooperating loops. The send loop
//! multicasts new messages at the configured pace, keeps idle sessions
//! alive with heartbeats, and announces the end of the session. The
//! request loop demultiplexes unicast retransmit requests per remote
//! host and dispatches bounded-concurrency workers that replay the
//! missing ranges.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::PublisherConfig;
use crate::constants::{
    COUNT_END_OF_SESSION, COUNT_HEARTBEAT, HEADER_SIZE, HEARTBEAT_INTERVAL, MAX_CONCURRENT_RETRANS,
    MAX_MESSAGE_SIZE, MAX_UDP_SIZE, RETRANS_BURST, SEND_CYCLE, SEND_CYCLE_BUSY, SESSION_TAG_SIZE,
};
use crate::error::{MoldError, Result};
use crate::supervisor::RunFlag;
use crate::transport::McastEndpoint;
use crate::wire::{self, Header, Message};

/// Shared publisher counters
#[derive(Debug, Default)]
pub struct ServerStats {
    sent: AtomicU64,
    heartbeats: AtomicU64,
    sleeps: AtomicU64,
    received: AtomicU64,
    errors: AtomicU64,
    resent: AtomicU64,
    max_workers: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStatsSnapshot {
    /// Datagrams multicast, heartbeats and sentinel included
    pub sent: u64,
    /// Heartbeats multicast
    pub heartbeats: u64,
    /// Pacing cycles that slept
    pub sleeps: u64,
    /// Request datagrams received
    pub received: u64,
    /// Request datagrams rejected
    pub errors: u64,
    /// Datagrams retransmitted unicast
    pub resent: u64,
    /// Most retransmit workers observed at once
    pub max_workers: u64,
}

impl ServerStats {
    /// Copy the counters out
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            sleeps: self.sleeps.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            resent: self.resent.load(Ordering::Relaxed),
            max_workers: self.max_workers.load(Ordering::Relaxed),
        }
    }
}

/// Retransmit state for one requesting host.
///
/// `ack_base` only grows while the worker replays; `nak_end` grows
/// monotonically as further requests arrive, extending a running
/// worker's range instead of spawning another.
struct HostRecord {
    remote: SocketAddr,
    ack_base: AtomicU64,
    nak_end: AtomicU64,
    active: AtomicBool,
}

impl HostRecord {
    fn new(remote: SocketAddr, ack_base: u64) -> Self {
        Self {
            remote,
            ack_base: AtomicU64::new(ack_base),
            nak_end: AtomicU64::new(ack_base),
            active: AtomicBool::new(false),
        }
    }
}

/// Publisher bound to a transport endpoint
pub struct Server<E: McastEndpoint> {
    endpoint: E,
    session: String,
    ppms: usize,
    log: RwLock<Vec<Message>>,
    send_seq: AtomicU64,
    end_session: AtomicBool,
    end_wait: AtomicU64,
    end_deadline: Mutex<Option<Instant>>,
    hosts: Mutex<HashMap<IpAddr, Arc<HostRecord>>>,
    workers: AtomicUsize,
    run: RunFlag,
    stats: ServerStats,
}

impl<E: McastEndpoint + 'static> Server<E> {
    /// Open `endpoint` toward the configured group and prepare an empty
    /// log; the sequence space is 1-based.
    pub fn new(mut endpoint: E, cfg: &PublisherConfig) -> Result<Self> {
        if cfg.session.len() > SESSION_TAG_SIZE {
            return Err(MoldError::config(format!(
                "session tag {:?} exceeds {} bytes",
                cfg.session, SESSION_TAG_SIZE
            )));
        }
        if cfg.ppms == 0 {
            return Err(MoldError::config("ppms must be at least 1"));
        }
        endpoint.open_send(cfg.effective_group(), cfg.port, cfg.loopback, cfg.interface)?;
        Ok(Self {
            endpoint,
            session: cfg.session.clone(),
            ppms: cfg.ppms,
            log: RwLock::new(Vec::new()),
            send_seq: AtomicU64::new(1),
            end_session: AtomicBool::new(false),
            end_wait: AtomicU64::new(cfg.end_session_wait),
            end_deadline: Mutex::new(None),
            hosts: Mutex::new(HashMap::new()),
            workers: AtomicUsize::new(0),
            run: RunFlag::new(),
            stats: ServerStats::default(),
        })
    }

    /// Append messages to the log.
    ///
    /// A message that can never fit a datagram is rejected here so the
    /// send loop cannot jam on it.
    pub fn feed(&self, msgs: Vec<Message>) -> Result<()> {
        if let Some(big) = msgs.iter().find(|m| m.data.len() > MAX_MESSAGE_SIZE) {
            return Err(MoldError::OversizedMessage {
                size: big.data.len(),
            });
        }
        self.log.write().extend(msgs);
        Ok(())
    }

    /// Announce the end of the session once the log drains, then exit
    /// after at least `waits` grace seconds. Idempotent; a larger grace
    /// period wins.
    pub fn end_session(&self, waits: u64) {
        self.end_wait.fetch_max(waits, Ordering::Relaxed);
        self.end_session.store(true, Ordering::Relaxed);
    }

    /// The flag both loops observe
    pub fn run_flag(&self) -> RunFlag {
        self.run.clone()
    }

    /// Next sequence the send loop will multicast
    pub fn send_seq(&self) -> u64 {
        self.send_seq.load(Ordering::Acquire)
    }

    /// Messages fed so far
    pub fn log_len(&self) -> usize {
        self.log.read().len()
    }

    /// True once everything fed has been multicast
    pub fn drained(&self) -> bool {
        self.send_seq() as usize > self.log_len()
    }

    /// Shared counters
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Log the counters the way the operators watch them
    pub fn report(&self) {
        let s = self.stats.snapshot();
        info!(
            "sent: {} heartbeats: {} seq: {} sleeps: {} recv: {} errors: {} resent: {} max workers: {}",
            s.sent,
            s.heartbeats,
            self.send_seq(),
            s.sleeps,
            s.received,
            s.errors,
            s.resent,
            s.max_workers
        );
    }

    fn mcast(&self, buf: &[u8]) {
        match self.endpoint.send(buf) {
            Ok(_) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => error!("multicast send failed: {}", e),
        }
    }

    fn mcast_header(&self, buf: &mut [u8], sequence: u64, message_count: u16) {
        let head = Header {
            session: self.session.clone(),
            sequence,
            message_count,
        };
        match wire::encode_header(&head, buf) {
            Ok(()) => self.mcast(&buf[..HEADER_SIZE]),
            Err(e) => error!("header encode failed: {}", e),
        }
    }

    /// Rate-paced multicast of new messages, heartbeats, and the
    /// end-of-session sentinel. Runs until the flag flips or the
    /// post-sentinel grace period expires.
    pub fn send_loop(&self) {
        let mut buf = [0u8; MAX_UDP_SIZE];
        let mut last_send = Instant::now();
        while self.run.is_running() {
            let cycle = Instant::now();
            let mut seq = self.send_seq.load(Ordering::Acquire);
            let log_len = self.log.read().len() as u64;
            if seq > log_len {
                if cycle.duration_since(last_send) >= HEARTBEAT_INTERVAL {
                    self.stats.heartbeats.fetch_add(1, Ordering::Relaxed);
                    self.mcast_header(&mut buf, seq, COUNT_HEARTBEAT);
                    last_send = Instant::now();
                }
                let deadline = *self.end_deadline.lock();
                if let Some(at) = deadline {
                    if Instant::now() >= at {
                        self.run.stop();
                        break;
                    }
                } else if self.end_session.load(Ordering::Relaxed) {
                    self.mcast_header(&mut buf, seq, COUNT_END_OF_SESSION);
                    last_send = Instant::now();
                    let wait = self.end_wait.load(Ordering::Relaxed);
                    *self.end_deadline.lock() = Some(Instant::now() + Duration::from_secs(wait));
                    info!("end of session announced, exiting in {}s", wait);
                }
                thread::yield_now();
                continue;
            }
            for _ in 0..self.ppms {
                let log = self.log.read();
                if seq > log.len() as u64 {
                    break;
                }
                let (count, written) = wire::marshal(&mut buf[HEADER_SIZE..], &log[(seq - 1) as usize..]);
                drop(log);
                if count == 0 {
                    // unpackable entries never reach the log, see feed()
                    break;
                }
                let head = Header {
                    session: self.session.clone(),
                    sequence: seq,
                    message_count: count as u16,
                };
                match wire::encode_header(&head, &mut buf) {
                    Ok(()) => {
                        self.mcast(&buf[..HEADER_SIZE + written]);
                        last_send = Instant::now();
                    }
                    Err(e) => error!("header encode failed: {}", e),
                }
                seq += count as u64;
            }
            self.send_seq.store(seq, Ordering::Release);
            let elapsed = cycle.elapsed();
            if elapsed < SEND_CYCLE_BUSY {
                self.stats.sleeps.fetch_add(1, Ordering::Relaxed);
                thread::sleep(SEND_CYCLE - elapsed);
            }
        }
    }

    /// Service unicast retransmit requests until the flag flips.
    ///
    /// Each valid request updates the per-host record and, when the host
    /// has no worker running and the global cap allows, dispatches one.
    pub fn request_loop(self: Arc<Self>) {
        let mut buf = [0u8; MAX_UDP_SIZE];
        while self.run.is_running() {
            let (n, from) = match self.endpoint.recv(&mut buf) {
                Ok(Some(got)) => got,
                Ok(None) => continue,
                Err(e) => {
                    error!("request receive failed: {}", e);
                    continue;
                }
            };
            self.stats.received.fetch_add(1, Ordering::Relaxed);
            Self::process_request(&self, &buf[..n], from);
        }
    }

    fn process_request(srv: &Arc<Self>, data: &[u8], from: SocketAddr) {
        if data.len() != HEADER_SIZE {
            srv.stats.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let head = match wire::decode_header(data) {
            Ok(h) => h,
            Err(e) => {
                debug!("bad request from {}: {}", from, e);
                srv.stats.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let send_seq = srv.send_seq.load(Ordering::Acquire);
        if head.sequence >= send_seq
            || head.message_count == COUNT_HEARTBEAT
            || head.message_count == COUNT_END_OF_SESSION
        {
            debug!(
                "invalid request from {}: seq {} count {} (at {})",
                from, head.sequence, head.message_count, send_seq
            );
            srv.stats.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // never implicate sequences that have not been multicast yet
        let nak_end = (head.sequence + u64::from(head.message_count)).min(send_seq);
        let record = {
            let mut hosts = srv.hosts.lock();
            let record = hosts
                .entry(from.ip())
                .or_insert_with(|| Arc::new(HostRecord::new(from, head.sequence)));
            if !record.active.load(Ordering::Acquire) {
                record.ack_base.store(head.sequence, Ordering::Release);
            }
            record.nak_end.fetch_max(nak_end, Ordering::AcqRel);
            Arc::clone(record)
        };
        if !record.active.load(Ordering::Acquire)
            && srv.workers.load(Ordering::Acquire) < MAX_CONCURRENT_RETRANS
            && record
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let running = srv.workers.fetch_add(1, Ordering::AcqRel) + 1;
            srv.stats
                .max_workers
                .fetch_max(running as u64, Ordering::Relaxed);
            let srv = Arc::clone(srv);
            thread::spawn(move || srv.retransmit_worker(record));
        }
    }

    /// Replay `[ack_base, nak_end)` unicast to one host, re-reading
    /// `nak_end` each packet so requests arriving mid-run extend the
    /// range.
    fn retransmit_worker(self: Arc<Self>, record: Arc<HostRecord>) {
        debug!(
            "retransmitting to {}: {} .. {}",
            record.remote,
            record.ack_base.load(Ordering::Acquire),
            record.nak_end.load(Ordering::Acquire)
        );
        let mut buf = [0u8; MAX_UDP_SIZE];
        let mut burst = 0usize;
        loop {
            let ack = record.ack_base.load(Ordering::Acquire);
            let end = record.nak_end.load(Ordering::Acquire);
            if ack >= end {
                break;
            }
            let (count, written) = {
                let log = self.log.read();
                let hi = ((end - 1) as usize).min(log.len());
                wire::marshal(&mut buf[HEADER_SIZE..], &log[(ack - 1) as usize..hi])
            };
            if count == 0 {
                break;
            }
            let head = Header {
                session: self.session.clone(),
                sequence: ack,
                message_count: count as u16,
            };
            if let Err(e) = wire::encode_header(&head, &mut buf) {
                error!("header encode failed: {}", e);
                break;
            }
            if let Err(e) = self
                .endpoint
                .send_to(&buf[..HEADER_SIZE + written], record.remote)
            {
                // leave ack_base at the failed packet for the next request
                warn!("retransmit to {} failed: {}", record.remote, e);
                break;
            }
            self.stats.resent.fetch_add(1, Ordering::Relaxed);
            record.ack_base.store(ack + count as u64, Ordering::Release);
            burst += 1;
            if burst >= RETRANS_BURST {
                burst = 0;
                thread::sleep(Duration::from_millis(1));
            }
        }
        record.active.store(false, Ordering::Release);
        self.workers.fetch_sub(1, Ordering::AcqRel);
    }

    #[cfg(test)]
    fn set_send_seq(&self, seq: u64) {
        self.send_seq.store(seq, Ordering::Release);
    }
}
