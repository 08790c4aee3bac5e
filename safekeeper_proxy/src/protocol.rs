//! Wire types and framing shared by the broadcaster's two channels.
//!
//! The primary speaks the physical replication copy-data protocol:
//! big-endian integers, `w` frames carrying WAL, `k` keepalives, and
//! `r` standby status updates going back. The safekeepers speak fixed
//! binary records encoded with [`LeSer`]; the encoding, not anyone's
//! struct layout, defines the format.

use std::time::SystemTime;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use walutils::lsn::Lsn;

/// proxy-safekeeper protocol version; a peer greeting with anything
/// else is a terminal error
pub const SK_PROTOCOL_VERSION: u32 = 1;

/// Upper bound on the broadcast set; also the width of the per-message
/// acknowledgement mask.
pub const MAX_SAFEKEEPERS: usize = 64;

/// 'w' + startPos + walEnd + timestamp
pub const XLOG_HDR_SIZE: usize = 1 + 8 + 8 + 8;
pub const XLOG_HDR_START_POS: usize = 1;
pub const XLOG_HDR_END_POS: usize = 9;

/// Serialized sizes of the election records, used to size partial-read
/// buffers. Checked against the encoder in the tests below.
pub const SERVER_INFO_SIZE: usize = 56;
pub const NODE_ID_SIZE: usize = 24;
pub const ACK_SIZE: usize = 8;

pub type SystemId = u64;

/// Candidate identity for leader election.
///
/// Total order: by term, ties broken by bytewise uuid comparison. The
/// derived implementation does exactly that thanks to field order.
#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeId {
    pub term: u64,
    pub uuid: [u8; 16],
}

/// Information about the primary, sent once to each safekeeper when a
/// connection is (re)established. The safekeeper answers with the same
/// record describing itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// proxy-safekeeper protocol version
    pub protocol_version: u32,
    /// Postgres server version
    pub pg_version: u32,
    pub system_id: SystemId,
    pub wal_seg_size: u32,
    pub timeline: u32,
    /// highest LSN known to the server at connect time
    pub wal_end: Lsn,
    pub node_id: NodeId,
}

/// Decode the starting LSN of a `w` copy-data frame.
pub fn wal_frame_start(frame: &[u8]) -> Option<Lsn> {
    if frame.len() < XLOG_HDR_SIZE || frame[0] != b'w' {
        return None;
    }
    Some(Lsn(BigEndian::read_u64(&frame[XLOG_HDR_START_POS..])))
}

/// Decode the end-of-record LSN of a `w` copy-data frame.
pub fn wal_frame_end(frame: &[u8]) -> Option<Lsn> {
    if frame.len() < XLOG_HDR_SIZE || frame[0] != b'w' {
        return None;
    }
    Some(Lsn(BigEndian::read_u64(&frame[XLOG_HDR_END_POS..])))
}

/// Overwrite the walEnd slot of a `w` frame header with the end of this
/// record, so a safekeeper can derive the record size without parsing
/// the payload.
pub fn rewrite_wal_frame_end(frame: &mut [u8], end: Lsn) {
    BigEndian::write_u64(&mut frame[XLOG_HDR_END_POS..XLOG_HDR_END_POS + 8], end.0);
}

/// The shutdown record: a WAL-header-sized buffer whose first byte is 'q'.
pub fn quit_message() -> [u8; XLOG_HDR_SIZE] {
    let mut msg = [0u8; XLOG_HDR_SIZE];
    msg[0] = b'q';
    msg
}

/// Append the body of a Standby Status Update to `buf`.
///
/// Write and flush positions both report the quorum-acknowledged LSN;
/// the apply position is left invalid, replicas apply on their own
/// schedule.
pub fn write_feedback_body(buf: &mut BytesMut, ack: Lsn, now: i64) {
    buf.put_u8(b'r');
    buf.put_u64(ack.0); /* write */
    buf.put_u64(ack.0); /* flush */
    buf.put_u64(0); /* apply */
    buf.put_i64(now); /* sendTime */
    buf.put_u8(0); /* replyRequested */
}

const FEEDBACK_BODY_SIZE: usize = 1 + 8 + 8 + 8 + 8 + 1;

/// Body length of the `r` frame produced by [`write_feedback_body`].
pub fn feedback_body_size() -> usize {
    FEEDBACK_BODY_SIZE
}

/// Current time as a Postgres timestamp: microseconds since 2000-01-01.
pub fn current_timestamp() -> i64 {
    const UNIX_EPOCH_JDATE: u64 = 2440588; /* == date2j(1970, 1, 1) */
    const POSTGRES_EPOCH_JDATE: u64 = 2451545; /* == date2j(2000, 1, 1) */
    const SECS_PER_DAY: u64 = 86400;
    const USECS_PER_SEC: u64 = 1000000;
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(n) => {
            ((n.as_secs() - ((POSTGRES_EPOCH_JDATE - UNIX_EPOCH_JDATE) * SECS_PER_DAY))
                * USECS_PER_SEC
                + n.subsec_micros() as u64) as i64
        }
        Err(_) => panic!("system time is before the unix epoch"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use walutils::bin_ser::LeSer;

    #[test]
    fn test_node_id_ordering() {
        let a = NodeId {
            term: 5,
            uuid: [0xFF; 16],
        };
        let b = NodeId {
            term: 7,
            uuid: [0x00; 16],
        };
        // term dominates, no matter the uuids
        assert!(a < b);

        // equal terms fall back to bytewise uuid comparison
        let mut c = a;
        c.uuid[15] = 0xFE;
        assert!(c < a);
        let mut d = a;
        d.uuid[0] = 0xFE;
        assert!(d < c);

        assert_eq!(a.max(b).term, 7);
        assert_eq!(a.max(a), a);
    }

    #[test]
    fn test_record_sizes() {
        let info = ServerInfo {
            protocol_version: SK_PROTOCOL_VERSION,
            pg_version: 140005,
            system_id: 0x1122334455667788,
            wal_seg_size: 16 * 1024 * 1024,
            timeline: 1,
            wal_end: Lsn(0x0100_0000),
            node_id: NodeId {
                term: 3,
                uuid: [7; 16],
            },
        };
        assert_eq!(info.ser().unwrap().len(), SERVER_INFO_SIZE);
        assert_eq!(info.node_id.ser().unwrap().len(), NODE_ID_SIZE);
        assert_eq!(1u64.ser().unwrap().len(), ACK_SIZE);

        let decoded = ServerInfo::des(&info.ser().unwrap()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_wal_frame_header() {
        // 'w', start 0x100, end 0 (to be rewritten), timestamp 0, 4 payload bytes
        let mut frame = hex_literal::hex!(
            "77 0000000000000100 0000000000000000 0000000000000000 DEADBEEF"
        )
        .to_vec();
        assert_eq!(wal_frame_start(&frame), Some(Lsn(0x100)));

        let end = Lsn(0x100 + frame.len() as u64 - XLOG_HDR_SIZE as u64);
        rewrite_wal_frame_end(&mut frame, end);
        assert_eq!(wal_frame_end(&frame), Some(Lsn(0x104)));
        // payload untouched
        assert_eq!(&frame[XLOG_HDR_SIZE..], hex_literal::hex!("DEADBEEF"));

        // keepalives and runts don't parse
        assert_eq!(wal_frame_start(b"k"), None);
        assert_eq!(wal_frame_start(b"w123"), None);
    }

    #[test]
    fn test_feedback_body_layout() {
        let mut buf = BytesMut::new();
        write_feedback_body(&mut buf, Lsn(0x0102030405060708), 0x1112131415161718);
        assert_eq!(buf.len(), feedback_body_size());
        let expected = hex_literal::hex!(
            "72 0102030405060708 0102030405060708 0000000000000000 1112131415161718 00"
        );
        assert_eq!(&buf[..], expected);
    }
}
