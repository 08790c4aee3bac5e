//! Ordered queue of WAL messages awaiting safekeeper acknowledgement.
//!
//! Messages are identified by a monotonically increasing sequence
//! number instead of the raw pointers the prototype used; per-peer
//! cursors stay valid across head trimming. A message is pinned in the
//! queue until every configured safekeeper has acknowledged it.

use std::collections::VecDeque;

use anyhow::{bail, Result};
use bytes::{Bytes, BytesMut};

use crate::protocol::{self, XLOG_HDR_SIZE};
use walutils::lsn::Lsn;

pub type MsgSeq = u64;

pub struct WalMessage {
    /// starting LSN of the record, decoded from the copy-data header
    pub wal_pos: Lsn,
    /// the raw frame, header included, forwarded to peers verbatim
    pub data: Bytes,
    /// bit per safekeeper that has acknowledged this message
    pub ack_mask: u64,
}

impl WalMessage {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn end_pos(&self) -> Lsn {
        self.wal_pos + (self.data.len() - XLOG_HDR_SIZE) as u64
    }
}

pub struct WalMsgQueue {
    msgs: VecDeque<WalMessage>,
    /// sequence number of the message at the queue head
    first_seq: MsgSeq,
    /// mask with a bit set for every configured safekeeper
    full_mask: u64,
}

impl WalMsgQueue {
    pub fn new(n_safekeepers: usize) -> WalMsgQueue {
        assert!(n_safekeepers >= 1 && n_safekeepers <= protocol::MAX_SAFEKEEPERS);
        let full_mask = if n_safekeepers == 64 {
            u64::MAX
        } else {
            (1u64 << n_safekeepers) - 1
        };
        WalMsgQueue {
            msgs: VecDeque::new(),
            first_seq: 0,
            full_mask,
        }
    }

    /// Append a `w` frame to the queue tail.
    ///
    /// The header's walEnd slot is rewritten to the end of this record
    /// so safekeepers can derive the record size without parsing.
    pub fn push(&mut self, mut frame: BytesMut) -> Result<MsgSeq> {
        let wal_pos = match protocol::wal_frame_start(&frame) {
            Some(lsn) => lsn,
            None => bail!("malformed WAL frame of {} bytes from the server", frame.len()),
        };
        let end = wal_pos + (frame.len() - XLOG_HDR_SIZE) as u64;
        protocol::rewrite_wal_frame_end(&mut frame, end);

        self.msgs.push_back(WalMessage {
            wal_pos,
            data: frame.freeze(),
            ack_mask: 0,
        });
        Ok(self.first_seq + self.msgs.len() as u64 - 1)
    }

    pub fn get(&self, seq: MsgSeq) -> Option<&WalMessage> {
        seq.checked_sub(self.first_seq)
            .and_then(|i| self.msgs.get(i as usize))
    }

    /// Record an acknowledgement of `seq` from safekeeper `peer`.
    pub fn ack(&mut self, seq: MsgSeq, peer: usize) {
        if let Some(i) = seq.checked_sub(self.first_seq) {
            if let Some(msg) = self.msgs.get_mut(i as usize) {
                msg.ack_mask |= 1 << peer;
            }
        }
    }

    /// Drop every head message acknowledged by all safekeepers.
    pub fn trim(&mut self) -> usize {
        let mut dropped = 0;
        while let Some(msg) = self.msgs.front() {
            if msg.ack_mask != self.full_mask {
                break;
            }
            self.msgs.pop_front();
            self.first_seq += 1;
            dropped += 1;
        }
        dropped
    }

    /// Walk from the head and find the oldest message safekeeper `peer`
    /// has not acknowledged yet. This is what makes redelivery after a
    /// reconnect work: the peer's bits stay unset while it is away.
    pub fn next_unacked(&self, peer: usize) -> Option<MsgSeq> {
        let bit = 1u64 << peer;
        self.msgs
            .iter()
            .position(|msg| msg.ack_mask & bit == 0)
            .map(|i| self.first_seq + i as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }
}
