//! moldcast - Reliable UDP multicast message distribution
//!
//! A single publisher streams an ordered, sequence-numbered session of
//! opaque messages to a multicast group; subscribers repair gaps with
//! unicast retransmit requests. Heartbeats keep idle sessions alive and
//! an explicit sentinel closes the stream.

pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod server;
pub mod supervisor;
pub mod transport;
pub mod wire;

// Re-export main components
pub use client::{Client, ClientCore, ClientStats, ClientStatsSnapshot, PacketOutcome};
pub use config::{PublisherConfig, SubscriberConfig};
pub use error::{MoldError, Result};
pub use server::{Server, ServerStats, ServerStatsSnapshot};
pub use supervisor::RunFlag;
pub use transport::{Capabilities, McastEndpoint, MemBus, MemEndpoint, UdpEndpoint};
pub use wire::{Header, Message};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_core_round_trip_through_public_api() {
        let mut buf = [0u8; constants::MAX_UDP_SIZE];
        let msgs = vec![Message::new(b"tick".to_vec())];
        let (count, written) = wire::marshal(&mut buf[constants::HEADER_SIZE..], &msgs);
        let head = Header {
            session: "20180101".into(),
            sequence: 1,
            message_count: count as u16,
        };
        wire::encode_header(&head, &mut buf).unwrap();

        let stats = Arc::new(ClientStats::default());
        let mut core = ClientCore::new(1, stats);
        let out = core
            .on_packet(&buf[..constants::HEADER_SIZE + written])
            .unwrap();
        assert_eq!(out.ready.unwrap(), msgs);
        assert_eq!(core.expected_seq(), 2);
    }

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
