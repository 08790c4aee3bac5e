//! Receive streaming WAL and broadcast it to the safekeepers.
//!
//! A single `Broadcaster` value owns every piece of state: the peer
//! state machines, the pending-message queue, the election tallies and
//! the feedback cursor. The event loop is a method; one thread drives
//! everything, and the only suspension point is the readiness wait.

use std::io;
use std::os::unix::io::RawFd;

use anyhow::{bail, Result};
use bytes::BytesMut;
use tracing::*;

use crate::protocol::{self, NodeId, ServerInfo};
use crate::safekeeper::{Safekeeper, SafekeeperState};
use crate::sock::{self, Readiness};
use crate::wal_queue::{MsgSeq, WalMsgQueue};
use crate::walreceiver::{ReplMessage, WalReceiver};
use walutils::bin_ser::LeSer;
use walutils::lsn::Lsn;

/// Poll timeout; paces reconnection attempts for Offline peers.
pub const RECONNECT_TIMEOUT_MS: i32 = 1000;

/// What a processed peer event asks the event loop to do upstream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BroadcastAction {
    None,
    /// a quorum of verdicts arrived; start pulling WAL from the server
    ElectionWon,
    /// the quorum commit point advanced; report it to the server
    CommitAdvanced(Lsn),
}

pub struct Broadcaster {
    safekeepers: Vec<Safekeeper>,
    quorum: usize,
    server_info: ServerInfo,
    /// serialized ServerInfo, written to every peer at handshake
    greeting: Vec<u8>,
    queue: WalMsgQueue,
    /// last commit position reported to the server; never goes back
    last_ack_lsn: Lsn,
    /// highest candidate observed during the voting round
    max_node_id: NodeId,
    n_connected: usize,
    n_votes: usize,
    /// the proposal is frozen once a quorum of greetings arrived
    election_done: bool,
    election_won: bool,
}

impl Broadcaster {
    pub fn new(
        safekeepers: Vec<(String, u16)>,
        quorum: usize,
        server_info: ServerInfo,
    ) -> Result<Broadcaster> {
        let n = safekeepers.len();
        let greeting = server_info.ser()?;
        Ok(Broadcaster {
            safekeepers: safekeepers
                .into_iter()
                .map(|(host, port)| Safekeeper::new(host, port))
                .collect(),
            quorum,
            server_info,
            greeting,
            queue: WalMsgQueue::new(n),
            last_ack_lsn: Lsn(0),
            max_node_id: server_info.node_id,
            n_connected: 0,
            n_votes: 0,
            election_done: false,
            election_won: false,
        })
    }

    /// WAL position acknowledged by a quorum: with the peers' flush
    /// positions sorted ascending, the one at index `n - quorum` is the
    /// highest LSN that at least `quorum` peers have reached.
    pub fn acknowledged_lsn(&self) -> Lsn {
        let mut acks: Vec<Lsn> = self.safekeepers.iter().map(|sk| sk.ack_lsn).collect();
        acks.sort();
        acks[self.safekeepers.len() - self.quorum]
    }

    pub fn last_ack_lsn(&self) -> Lsn {
        self.last_ack_lsn
    }

    pub fn proposed_node_id(&self) -> NodeId {
        self.max_node_id
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Where to ask the server to start streaming: the acknowledged
    /// position (or the server's own WAL end if the safekeepers are
    /// empty), rounded down to a segment boundary.
    pub fn replication_start_lsn(&self) -> Lsn {
        let mut start = self.acknowledged_lsn();
        if start == Lsn(0) {
            start = self.server_info.wal_end;
        }
        start.segment_start(self.server_info.wal_seg_size as u64)
    }

    /// Initiate connections to all safekeeper nodes.
    pub fn open_connections(&mut self) {
        for sk in &mut self.safekeepers {
            sk.start_connection(&self.greeting);
        }
    }

    fn retry_offline(&mut self) {
        for sk in &mut self.safekeepers {
            if matches!(sk.state, SafekeeperState::Offline) {
                sk.start_connection(&self.greeting);
            }
        }
    }

    fn peer_interest(&self) -> (Vec<(RawFd, Readiness)>, Vec<usize>) {
        let mut fds = Vec::new();
        let mut idx = Vec::new();
        for (i, sk) in self.safekeepers.iter().enumerate() {
            if let Some(entry) = sk.poll_interest() {
                fds.push(entry);
                idx.push(i);
            }
        }
        (fds, idx)
    }

    fn reset_peer(&mut self, i: usize, why: &io::Error) {
        let sk = &mut self.safekeepers[i];
        info!("connection with safekeeper {} failed: {}", sk.addr(), why);
        sk.reset(&self.greeting);
    }

    fn finish_connect(&mut self, i: usize) {
        let sk = &mut self.safekeepers[i];
        if let Err(e) = sk.complete_connection(&self.greeting) {
            info!("failed to connect to safekeeper {}: {}", sk.addr(), e);
            sk.disconnect();
        }
    }

    /// Enqueue a `w` frame from the server and offer it to every idle
    /// peer.
    pub fn push_wal(&mut self, frame: BytesMut) -> Result<()> {
        self.queue.push(frame)?;
        for i in 0..self.safekeepers.len() {
            self.schedule_peer(i);
        }
        Ok(())
    }

    /// Dispatch the oldest message the peer has not acknowledged, if
    /// the peer is idle and such a message exists.
    fn schedule_peer(&mut self, i: usize) {
        if !matches!(self.safekeepers[i].state, SafekeeperState::Idle) {
            return;
        }
        let seq = match self.queue.next_unacked(i) {
            Some(seq) => seq,
            None => return,
        };
        let data = match self.queue.get(seq) {
            Some(msg) => msg.data.clone(),
            None => return,
        };
        let sk = &mut self.safekeepers[i];
        if let Err(e) = sk.start_send(seq, &data) {
            info!("sending WAL to safekeeper {} failed: {}", sk.addr(), e);
            sk.reset(&self.greeting);
        }
    }

    /// A peer completed the handshake: account it, raise the candidate
    /// and, once a quorum is connected, fix the proposal and send it to
    /// everyone still waiting in Vote. Peers arriving later get the
    /// settled proposal immediately.
    fn note_greeting(&mut self, i: usize, info: ServerInfo) -> Result<()> {
        if info.protocol_version != protocol::SK_PROTOCOL_VERSION {
            bail!(
                "safekeeper {} has incompatible protocol version {} vs. {}",
                self.safekeepers[i].addr(),
                info.protocol_version,
                protocol::SK_PROTOCOL_VERSION
            );
        }
        info!(
            "safekeeper {} joined with term {}, wal end {}",
            self.safekeepers[i].addr(),
            info.node_id.term,
            info.wal_end
        );
        self.n_connected += 1;
        if !self.election_done {
            if info.node_id > self.max_node_id {
                self.max_node_id = info.node_id;
            }
            if self.n_connected >= self.quorum {
                // a new run must produce a strictly higher term than
                // any it has observed
                self.max_node_id.term += 1;
                self.election_done = true;
                info!("proposing term {} to the voters", self.max_node_id.term);
            }
        }
        if self.election_done {
            self.dispatch_proposals()?;
        }
        Ok(())
    }

    fn dispatch_proposals(&mut self) -> Result<()> {
        let proposal = self.max_node_id.ser()?;
        for sk in &mut self.safekeepers {
            if matches!(sk.state, SafekeeperState::Vote) {
                if let Err(e) = sk.send_proposal(&proposal) {
                    info!(
                        "sending vote proposal to safekeeper {} failed: {}",
                        sk.addr(),
                        e
                    );
                    sk.reset(&self.greeting);
                }
            }
        }
        Ok(())
    }

    /// Judge a vote verdict. A peer returning anything but our
    /// proposal has seen a higher term: we are not the leader and must
    /// not continue.
    fn note_verdict(&mut self, i: usize, verdict: NodeId) -> Result<BroadcastAction> {
        if verdict != self.max_node_id {
            bail!(
                "safekeeper {} with term {} rejects our connection request with term {}",
                self.safekeepers[i].addr(),
                verdict.term,
                self.max_node_id.term
            );
        }
        self.n_votes += 1;
        let mut action = BroadcastAction::None;
        if self.n_votes == self.quorum && !self.election_won {
            self.election_won = true;
            info!(
                "successfully established connection with {} nodes, starting streaming",
                self.quorum
            );
            action = BroadcastAction::ElectionWon;
        }
        // a rejoining peer may have missed messages; serve them now
        self.schedule_peer(i);
        Ok(action)
    }

    fn note_ack(&mut self, i: usize, seq: MsgSeq, lsn: Lsn) -> BroadcastAction {
        if let Some(msg) = self.queue.get(seq) {
            if msg.end_pos() != lsn {
                warn!(
                    "safekeeper {} acknowledged {} instead of {}",
                    self.safekeepers[i].addr(),
                    lsn,
                    msg.end_pos()
                );
            }
        }
        self.queue.ack(seq, i);
        if lsn > self.safekeepers[i].ack_lsn {
            self.safekeepers[i].ack_lsn = lsn;
        }
        let action = self.handle_safekeeper_response();
        self.schedule_peer(i);
        action
    }

    /// Recompute the quorum commit point and trim fully-acknowledged
    /// messages off the queue head.
    fn handle_safekeeper_response(&mut self) -> BroadcastAction {
        let commit = self.acknowledged_lsn();
        let mut action = BroadcastAction::None;
        if commit > self.last_ack_lsn {
            self.last_ack_lsn = commit;
            action = BroadcastAction::CommitAdvanced(commit);
        }
        self.queue.trim();
        action
    }

    /// Process one readiness report for peer `i`.
    pub fn handle_peer_event(&mut self, i: usize, ready: Readiness) -> Result<BroadcastAction> {
        if ready.read {
            self.handle_peer_readable(i)
        } else if ready.write {
            self.handle_peer_writable(i)
        } else {
            Ok(BroadcastAction::None)
        }
    }

    fn handle_peer_readable(&mut self, i: usize) -> Result<BroadcastAction> {
        if matches!(self.safekeepers[i].state, SafekeeperState::Connecting) {
            // an error on a pending connect reports readability too
            self.finish_connect(i);
            return Ok(BroadcastAction::None);
        }
        if matches!(self.safekeepers[i].state, SafekeeperState::Handshake(_)) {
            match self.safekeepers[i].read_greeting() {
                Ok(None) => {}
                Ok(Some(info)) => self.note_greeting(i, info)?,
                Err(e) => self.reset_peer(i, &e),
            }
            return Ok(BroadcastAction::None);
        }
        if matches!(self.safekeepers[i].state, SafekeeperState::WaitVerdict(_)) {
            return match self.safekeepers[i].read_verdict() {
                Ok(None) => Ok(BroadcastAction::None),
                Ok(Some(verdict)) => self.note_verdict(i, verdict),
                Err(e) => {
                    self.reset_peer(i, &e);
                    Ok(BroadcastAction::None)
                }
            };
        }
        if matches!(self.safekeepers[i].state, SafekeeperState::RecvAck { .. }) {
            return match self.safekeepers[i].read_ack() {
                Ok(None) => Ok(BroadcastAction::None),
                Ok(Some((seq, lsn))) => Ok(self.note_ack(i, seq, lsn)),
                Err(e) => {
                    self.reset_peer(i, &e);
                    Ok(BroadcastAction::None)
                }
            };
        }
        // Vote, Idle, SendWal: nothing should arrive here, the
        // connection is broken
        if !matches!(self.safekeepers[i].state, SafekeeperState::Offline) {
            let why = io::Error::new(io::ErrorKind::Other, "unexpected data from the peer");
            self.reset_peer(i, &why);
        }
        Ok(BroadcastAction::None)
    }

    fn handle_peer_writable(&mut self, i: usize) -> Result<BroadcastAction> {
        if matches!(self.safekeepers[i].state, SafekeeperState::Connecting) {
            self.finish_connect(i);
            return Ok(BroadcastAction::None);
        }
        let inflight = match &self.safekeepers[i].state {
            SafekeeperState::SendWal { msg, .. } => Some(*msg),
            _ => None,
        };
        if let Some(seq) = inflight {
            let data = match self.queue.get(seq) {
                Some(msg) => msg.data.clone(),
                // a message in flight is pinned in the queue; if it is
                // gone the bookkeeping is broken beyond repair
                None => bail!(
                    "in-flight message {} of safekeeper {} is not in the queue",
                    seq,
                    self.safekeepers[i].addr()
                ),
            };
            if let Err(e) = self.safekeepers[i].continue_send(&data) {
                self.reset_peer(i, &e);
            }
            return Ok(BroadcastAction::None);
        }
        bail!(
            "unexpected write readiness for safekeeper {} in state {:?}",
            self.safekeepers[i].addr(),
            self.safekeepers[i].state
        );
    }

    /// One peer-only scheduling round: reconnect Offline peers, wait
    /// for readiness up to `timeout_ms`, process whatever fired.
    pub fn poll_peers(&mut self, timeout_ms: i32) -> Result<Vec<BroadcastAction>> {
        self.retry_offline();
        let (fds, idx) = self.peer_interest();
        let ready = sock::wait(&fds, timeout_ms)?;
        let mut actions = Vec::new();
        for (k, r) in ready.iter().enumerate() {
            if !r.read && !r.write {
                continue;
            }
            let action = self.handle_peer_event(idx[k], *r)?;
            if action != BroadcastAction::None {
                actions.push(action);
            }
        }
        Ok(actions)
    }

    /// WAL broadcasting loop: runs until the server stops streaming
    /// and every queued message has been acknowledged by all peers.
    pub fn run(&mut self, primary: &mut WalReceiver) -> Result<()> {
        self.open_connections();
        let mut streaming = true;
        let mut wal_streaming = false;

        while streaming || !self.queue.is_empty() {
            self.retry_offline();

            let (mut fds, idx) = self.peer_interest();
            let primary_slot = if streaming && wal_streaming {
                fds.push((
                    primary.raw_fd(),
                    Readiness {
                        read: true,
                        write: false,
                    },
                ));
                Some(fds.len() - 1)
            } else {
                None
            };

            let ready = sock::wait(&fds, RECONNECT_TIMEOUT_MS)?;

            // WAL from the server first; it feeds the queue the peers
            // are draining
            if let Some(slot) = primary_slot {
                if ready[slot].read {
                    loop {
                        match primary.poll_message()? {
                            Some(ReplMessage::Wal(frame)) => self.push_wal(frame)?,
                            Some(ReplMessage::StreamEnd) => {
                                streaming = false;
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }

            for k in 0..idx.len() {
                let r = ready[k];
                if !r.read && !r.write {
                    continue;
                }
                match self.handle_peer_event(idx[k], r)? {
                    BroadcastAction::None => {}
                    BroadcastAction::ElectionWon => {
                        let start = self.replication_start_lsn();
                        primary.start_replication(start, self.server_info.timeline)?;
                        wal_streaming = true;
                    }
                    BroadcastAction::CommitAdvanced(lsn) => {
                        if streaming {
                            if let Err(e) = primary.send_status_update(lsn) {
                                error!("could not send feedback to the server: {}", e);
                                streaming = false;
                            }
                        }
                    }
                }
            }
        }
        self.stop_safekeepers();
        Ok(())
    }

    /// Tell every connected peer we are done and close the sockets.
    pub fn stop_safekeepers(&mut self) {
        let quit = protocol::quit_message();
        for sk in &mut self.safekeepers {
            if sk.sock.is_some() {
                sk.send_quit(&quit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server_info() -> ServerInfo {
        ServerInfo {
            protocol_version: protocol::SK_PROTOCOL_VERSION,
            pg_version: 140005,
            system_id: 42,
            wal_seg_size: 16 * 1024 * 1024,
            timeline: 1,
            wal_end: Lsn(0x0200_0000),
            node_id: NodeId {
                term: 0,
                uuid: [0; 16],
            },
        }
    }

    fn test_broadcaster(n: usize, quorum: usize) -> Broadcaster {
        let peers = (0..n).map(|i| ("localhost".to_owned(), 7000 + i as u16)).collect();
        Broadcaster::new(peers, quorum, test_server_info()).unwrap()
    }

    fn greeting(term: u64, uuid_seed: u8, wal_end: Lsn) -> ServerInfo {
        ServerInfo {
            node_id: NodeId {
                term,
                uuid: [uuid_seed; 16],
            },
            wal_end,
            ..test_server_info()
        }
    }

    fn set_acks(b: &mut Broadcaster, acks: &[u64]) {
        for (sk, ack) in b.safekeepers.iter_mut().zip(acks) {
            sk.ack_lsn = Lsn(*ack);
        }
    }

    #[test]
    fn test_quorum_commit_point() {
        let mut b = test_broadcaster(3, 2);

        set_acks(&mut b, &[100, 100, 100]);
        assert_eq!(b.acknowledged_lsn(), Lsn(100));

        // lagging peer: commit follows the quorum, not the minimum
        set_acks(&mut b, &[100, 100, 50]);
        assert_eq!(b.acknowledged_lsn(), Lsn(100));
        set_acks(&mut b, &[200, 150, 50]);
        assert_eq!(b.acknowledged_lsn(), Lsn(150));
        set_acks(&mut b, &[200, 200, 50]);
        assert_eq!(b.acknowledged_lsn(), Lsn(200));
    }

    #[test]
    fn test_feedback_is_monotonic() {
        let mut b = test_broadcaster(3, 2);

        set_acks(&mut b, &[100, 100, 50]);
        assert_eq!(
            b.handle_safekeeper_response(),
            BroadcastAction::CommitAdvanced(Lsn(100))
        );
        assert_eq!(b.last_ack_lsn(), Lsn(100));

        // no progress, no feedback
        assert_eq!(b.handle_safekeeper_response(), BroadcastAction::None);

        // a peer rejoining behind the commit point must not move the
        // reported position backwards
        set_acks(&mut b, &[100, 60, 50]);
        assert_eq!(b.handle_safekeeper_response(), BroadcastAction::None);
        assert_eq!(b.last_ack_lsn(), Lsn(100));

        set_acks(&mut b, &[200, 150, 50]);
        assert_eq!(
            b.handle_safekeeper_response(),
            BroadcastAction::CommitAdvanced(Lsn(150))
        );
    }

    #[test]
    fn test_election_term_bump() {
        let mut b = test_broadcaster(3, 2);

        b.note_greeting(0, greeting(5, 1, Lsn(0))).unwrap();
        assert!(!b.election_done);
        b.note_greeting(1, greeting(7, 2, Lsn(0))).unwrap();
        // quorum of greetings: highest observed term plus one
        assert!(b.election_done);
        assert_eq!(b.proposed_node_id().term, 8);

        // a late greeting with a lower term does not disturb the
        // settled proposal
        b.note_greeting(2, greeting(6, 3, Lsn(0))).unwrap();
        assert_eq!(b.proposed_node_id().term, 8);
    }

    #[test]
    fn test_election_term_bump_second_run() {
        // a second run against the same peers observes the previous
        // term everywhere and still proposes something strictly higher
        let mut b = test_broadcaster(3, 2);
        b.note_greeting(0, greeting(8, 1, Lsn(0))).unwrap();
        b.note_greeting(1, greeting(8, 2, Lsn(0))).unwrap();
        assert_eq!(b.proposed_node_id().term, 9);
    }

    #[test]
    fn test_protocol_version_mismatch_is_fatal() {
        let mut b = test_broadcaster(1, 1);
        let mut info = greeting(1, 1, Lsn(0));
        info.protocol_version = protocol::SK_PROTOCOL_VERSION + 1;
        b.note_greeting(0, info).unwrap_err();
    }

    #[test]
    fn test_vote_rejection_is_fatal() {
        let mut b = test_broadcaster(3, 2);
        b.note_greeting(0, greeting(8, 1, Lsn(0))).unwrap();
        b.note_greeting(1, greeting(8, 2, Lsn(0))).unwrap();

        // a verdict carrying anything else than our proposal means a
        // higher term is out there
        let rogue = NodeId {
            term: 10,
            uuid: [9; 16],
        };
        b.note_verdict(0, rogue).unwrap_err();

        let mut b = test_broadcaster(3, 2);
        b.note_greeting(0, greeting(8, 1, Lsn(0))).unwrap();
        b.note_greeting(1, greeting(8, 2, Lsn(0))).unwrap();
        let accepted = b.proposed_node_id();
        assert_eq!(
            b.note_verdict(0, accepted).unwrap(),
            BroadcastAction::None
        );
        assert_eq!(
            b.note_verdict(1, accepted).unwrap(),
            BroadcastAction::ElectionWon
        );
    }

    #[test]
    fn test_replication_start_lsn() {
        let mut b = test_broadcaster(3, 2);
        let seg = 16 * 1024 * 1024u64;

        // no data on any safekeeper: fall back to the server's WAL end
        assert_eq!(b.replication_start_lsn(), Lsn(0x0200_0000));

        // otherwise: quorum position rounded down to a segment start
        set_acks(&mut b, &[seg + 17, seg + 17, 0]);
        assert_eq!(b.replication_start_lsn(), Lsn(seg));
    }
}
