//! Wire format: packet header and length-prefixed payload codec
//!
//! Every datagram starts with a fixed 20-byte header in network byte order:
//!
//! ```text
//! offset  size  field
//! 0       10    session tag (ASCII, NUL padded)
//! 10      8     sequence of the first message (u64, big endian)
//! 18      2     message count (u16, big endian)
//! ```
//!
//! Data packets follow the header with `message_count` entries, each a
//! u16 big-endian length and that many payload bytes. `message_count`
//! values `0` (heartbeat) and `0xffff` (end of session) carry no payload.

use crate::constants::{HEADER_SIZE, MAX_MESSAGES_PER_PACKET, MAX_PAYLOAD_SIZE, SESSION_TAG_SIZE};
use crate::error::{MoldError, Result};

/// Packet header shared by data, heartbeat, sentinel, and request packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Stream tag, at most [`SESSION_TAG_SIZE`] ASCII bytes; empty on
    /// requests (meaning "any session")
    pub session: String,
    /// Sequence of the first message in the packet, 1-based
    pub sequence: u64,
    /// Number of payload entries, or a sentinel value
    pub message_count: u16,
}

/// One application message: an opaque blob carried on the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Raw payload bytes
    pub data: Vec<u8>,
}

impl Message {
    /// Wrap raw bytes in a message
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

/// Encode a header into the first [`HEADER_SIZE`] bytes of `buf`.
///
/// The session tag is right-padded with NULs. Fails when the tag exceeds
/// [`SESSION_TAG_SIZE`] bytes or `buf` is too short.
pub fn encode_header(head: &Header, buf: &mut [u8]) -> Result<()> {
    if buf.len() < HEADER_SIZE {
        return Err(MoldError::malformed("buffer shorter than header"));
    }
    let tag = head.session.as_bytes();
    if tag.len() > SESSION_TAG_SIZE {
        return Err(MoldError::malformed("session tag longer than 10 bytes"));
    }
    buf[..SESSION_TAG_SIZE].fill(0);
    buf[..tag.len()].copy_from_slice(tag);
    buf[SESSION_TAG_SIZE..SESSION_TAG_SIZE + 8].copy_from_slice(&head.sequence.to_be_bytes());
    buf[SESSION_TAG_SIZE + 8..HEADER_SIZE].copy_from_slice(&head.message_count.to_be_bytes());
    Ok(())
}

/// Decode the first [`HEADER_SIZE`] bytes of `buf` into a header.
///
/// Trailing NULs are stripped from the session tag. Fails when `buf` is
/// shorter than the header.
pub fn decode_header(buf: &[u8]) -> Result<Header> {
    if buf.len() < HEADER_SIZE {
        return Err(MoldError::malformed("packet shorter than header"));
    }
    let tag_end = buf[..SESSION_TAG_SIZE]
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |i| i + 1);
    let session = String::from_utf8_lossy(&buf[..tag_end]).into_owned();
    let sequence = u64::from_be_bytes(buf[SESSION_TAG_SIZE..SESSION_TAG_SIZE + 8].try_into().unwrap());
    let message_count = u16::from_be_bytes(buf[SESSION_TAG_SIZE + 8..HEADER_SIZE].try_into().unwrap());
    Ok(Header {
        session,
        sequence,
        message_count,
    })
}

/// Encode the bare 20-byte retransmit request packet: empty session tag,
/// `sequence` = first needed, `count` = capped gap size.
pub fn encode_request(sequence: u64, count: u16) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[SESSION_TAG_SIZE..SESSION_TAG_SIZE + 8].copy_from_slice(&sequence.to_be_bytes());
    buf[SESSION_TAG_SIZE + 8..HEADER_SIZE].copy_from_slice(&count.to_be_bytes());
    buf
}

/// Pack as many messages as fit into `buf` as length-prefixed entries.
///
/// Returns `(count, bytes_written)`. Packing stops at the first message
/// that does not fit the remaining space, at [`MAX_PAYLOAD_SIZE`] total
/// bytes, or one short of [`MAX_MESSAGES_PER_PACKET`]. A return of
/// `(0, 0)` means the first message alone exceeds the packet capacity;
/// feeding rejects such messages, so the send path treats it as fatal.
pub fn marshal(buf: &mut [u8], msgs: &[Message]) -> (usize, usize) {
    let cap = buf.len().min(MAX_PAYLOAD_SIZE);
    let mut count = 0usize;
    let mut written = 0usize;
    for msg in msgs {
        let need = 2 + msg.data.len();
        if written + need > cap || count + 1 >= MAX_MESSAGES_PER_PACKET as usize {
            break;
        }
        buf[written..written + 2].copy_from_slice(&(msg.data.len() as u16).to_be_bytes());
        buf[written + 2..written + need].copy_from_slice(&msg.data);
        written += need;
        count += 1;
    }
    (count, written)
}

/// Parse a payload area back into messages, consuming `buf` exactly.
///
/// Fails when a length prefix is cut short or announces more bytes than
/// remain.
pub fn unmarshal(buf: &[u8]) -> Result<Vec<Message>> {
    let mut msgs = Vec::new();
    let mut at = 0usize;
    while at < buf.len() {
        if buf.len() - at < 2 {
            return Err(MoldError::truncated("length prefix cut short"));
        }
        let len = u16::from_be_bytes(buf[at..at + 2].try_into().unwrap()) as usize;
        at += 2;
        if buf.len() - at < len {
            return Err(MoldError::truncated("message body cut short"));
        }
        msgs.push(Message::new(&buf[at..at + len]));
        at += len;
    }
    Ok(msgs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_UDP_SIZE;
    use proptest::prelude::*;

    fn head(session: &str, sequence: u64, message_count: u16) -> Header {
        Header {
            session: session.to_string(),
            sequence,
            message_count,
        }
    }

    #[test]
    fn test_header_round_trip() {
        let h = head("20180101", 42, 3);
        let mut buf = [0u8; HEADER_SIZE];
        encode_header(&h, &mut buf).unwrap();
        assert_eq!(decode_header(&buf).unwrap(), h);
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let h = head("AB", 0x0102030405060708, 0x1024);
        let mut buf = [0u8; HEADER_SIZE];
        encode_header(&h, &mut buf).unwrap();
        assert_eq!(&buf[..3], b"AB\0");
        assert_eq!(buf[10], 0x01);
        assert_eq!(buf[17], 0x08);
        assert_eq!(&buf[18..], &[0x10, 0x24]);
    }

    #[test]
    fn test_header_rejects_long_session() {
        let h = head("01234567890", 1, 0);
        let mut buf = [0u8; HEADER_SIZE];
        assert!(matches!(
            encode_header(&h, &mut buf),
            Err(MoldError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_short_packet() {
        assert!(matches!(
            decode_header(&[0u8; HEADER_SIZE - 1]),
            Err(MoldError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn test_request_packet_shape() {
        let buf = encode_request(7, 60_000);
        let h = decode_header(&buf).unwrap();
        assert_eq!(h.session, "");
        assert_eq!(h.sequence, 7);
        assert_eq!(h.message_count, 60_000);
    }

    #[test]
    fn test_marshal_packs_in_order() {
        let msgs = vec![
            Message::new(vec![0x41]),
            Message::new(vec![0x42]),
            Message::new(vec![0x43]),
        ];
        let mut buf = [0u8; MAX_PAYLOAD_SIZE];
        let (count, written) = marshal(&mut buf, &msgs);
        assert_eq!(count, 3);
        assert_eq!(written, 9);
        assert_eq!(unmarshal(&buf[..written]).unwrap(), msgs);
    }

    #[test]
    fn test_marshal_stops_at_capacity() {
        let msgs = vec![Message::new(vec![0u8; 600]); 4];
        let mut buf = [0u8; MAX_PAYLOAD_SIZE];
        let (count, written) = marshal(&mut buf, &msgs);
        // two 602-byte entries fit in 1452 bytes, the third does not
        assert_eq!(count, 2);
        assert_eq!(written, 1204);
        assert!(HEADER_SIZE + written <= MAX_UDP_SIZE);
    }

    #[test]
    fn test_marshal_underflow_on_oversized_first() {
        let msgs = vec![Message::new(vec![0u8; MAX_PAYLOAD_SIZE])];
        let mut buf = [0u8; MAX_PAYLOAD_SIZE];
        assert_eq!(marshal(&mut buf, &msgs), (0, 0));
    }

    #[test]
    fn test_unmarshal_rejects_truncation() {
        // announces 4 bytes, provides 2
        let buf = [0x00, 0x04, 0xaa, 0xbb];
        assert!(matches!(
            unmarshal(&buf),
            Err(MoldError::TruncatedPayload { .. })
        ));
        // dangling single length byte
        assert!(matches!(
            unmarshal(&[0x00, 0x01, 0xcc, 0x00]),
            Err(MoldError::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn test_unmarshal_empty_is_empty() {
        assert!(unmarshal(&[]).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn prop_header_round_trip(
            session in "[ -~]{0,10}",
            sequence in any::<u64>(),
            message_count in any::<u16>(),
        ) {
            // trailing NULs cannot survive a round trip, printable ASCII does
            let h = head(&session, sequence, message_count);
            let mut buf = [0u8; HEADER_SIZE];
            encode_header(&h, &mut buf).unwrap();
            prop_assert_eq!(decode_header(&buf).unwrap(), h);
        }

        #[test]
        fn prop_marshal_round_trip(
            blobs in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..200), 0..40)
        ) {
            let msgs: Vec<Message> = blobs.into_iter().map(Message::new).collect();
            let mut buf = [0u8; MAX_PAYLOAD_SIZE];
            let (count, written) = marshal(&mut buf, &msgs);
            prop_assert!(written <= MAX_PAYLOAD_SIZE);
            let parsed = unmarshal(&buf[..written]).unwrap();
            prop_assert_eq!(&parsed[..], &msgs[..count]);
            if count < msgs.len() {
                // the first unpacked message genuinely did not fit
                prop_assert!(written + 2 + msgs[count].data.len() > MAX_PAYLOAD_SIZE);
            }
        }
    }
}
