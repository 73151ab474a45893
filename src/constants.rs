//! Protocol constants and tuning values
//!
//! Wire-format sizes and the pacing/retransmission parameters used
//! throughout the crate.

use std::time::Duration;

/// Maximum UDP datagram size on the wire (Ethernet MTU minus IP/UDP headers,
/// chosen so packets never fragment)
pub const MAX_UDP_SIZE: usize = 1472;

/// Fixed packet header size: 10-byte session tag + u64 sequence + u16 count
pub const HEADER_SIZE: usize = 20;

/// Session tag length in the header (ASCII, NUL padded)
pub const SESSION_TAG_SIZE: usize = 10;

/// Payload bytes available after the header in a full-size datagram
pub const MAX_PAYLOAD_SIZE: usize = MAX_UDP_SIZE - HEADER_SIZE;

/// Largest single message that fits a datagram (length prefix included)
pub const MAX_MESSAGE_SIZE: usize = MAX_PAYLOAD_SIZE - 2;

/// Valid data packets carry strictly fewer messages than this
pub const MAX_MESSAGES_PER_PACKET: u16 = 1024;

/// `message_count` value marking a heartbeat packet (no payloads)
pub const COUNT_HEARTBEAT: u16 = 0;

/// `message_count` value marking the end-of-session sentinel
pub const COUNT_END_OF_SESSION: u16 = 0xffff;

/// Cap on the `message_count` of a retransmit request; larger gaps span
/// multiple requests across rate-limit windows
pub const MAX_REQUEST_COUNT: u16 = 60_000;

/// Heartbeat cadence when the publisher has nothing to send
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Minimum spacing between retransmit requests from one subscriber
pub const REQUEST_INTERVAL: Duration = Duration::from_secs(5);

/// Global cap on concurrently running retransmit workers
pub const MAX_CONCURRENT_RETRANS: usize = 1000;

/// Default publisher pace in packets per millisecond
pub const DEFAULT_PPMS: usize = 100;

/// Default grace period after the end-of-session sentinel, in seconds
pub const DEFAULT_END_SESSION_WAIT: u64 = 5;

/// Send-loop cycle budget; a cycle finishing faster than
/// [`SEND_CYCLE_BUSY`] sleeps out the remainder of this
pub const SEND_CYCLE: Duration = Duration::from_millis(1);

/// Threshold under which a send cycle is considered idle enough to sleep
pub const SEND_CYCLE_BUSY: Duration = Duration::from_micros(900);

/// Retransmit workers yield for ~1 ms after this many packets so the
/// live multicast stream is not starved
pub const RETRANS_BURST: usize = 10;

/// Socket receive buffer requested for the multicast subscription
pub const RECV_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Socket send buffer requested for the publisher
pub const SEND_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Blocking-receive poll granularity; loops observe the run flag at
/// least this often
pub const RECV_POLL: Duration = Duration::from_millis(250);

/// Fallback group when the configured address is not multicast
pub const DEFAULT_MULTICAST_ADDR: [u8; 4] = [224, 0, 0, 1];

/// Default UDP port for the feed
pub const DEFAULT_PORT: u16 = 5858;

static_assertions::const_assert!(HEADER_SIZE == SESSION_TAG_SIZE + 8 + 2);
static_assertions::const_assert!(MAX_MESSAGE_SIZE + 2 + HEADER_SIZE == MAX_UDP_SIZE);
static_assertions::const_assert!((MAX_REQUEST_COUNT as usize) < (COUNT_END_OF_SESSION as usize));

/// Validate that the constants are mutually consistent
pub fn validate_constants() -> Result<(), &'static str> {
    if MAX_UDP_SIZE <= HEADER_SIZE {
        return Err("MAX_UDP_SIZE must exceed HEADER_SIZE");
    }
    // The smallest payload entry is an empty message (2-byte prefix), so a
    // full packet can never reach the count cap.
    if MAX_PAYLOAD_SIZE / 2 >= MAX_MESSAGES_PER_PACKET as usize {
        return Err("MAX_MESSAGES_PER_PACKET must exceed any packable count");
    }
    if MAX_MESSAGES_PER_PACKET >= COUNT_END_OF_SESSION {
        return Err("data counts must be distinguishable from the sentinel");
    }
    if SEND_CYCLE_BUSY >= SEND_CYCLE {
        return Err("SEND_CYCLE_BUSY must be below SEND_CYCLE");
    }
    if REQUEST_INTERVAL <= HEARTBEAT_INTERVAL {
        return Err("REQUEST_INTERVAL must exceed HEARTBEAT_INTERVAL");
    }
    Ok(())
}
