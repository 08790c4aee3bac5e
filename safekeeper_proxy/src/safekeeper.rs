//! Connection state machine for one safekeeper.
//!
//! Each configured safekeeper is driven independently through
//! connect, handshake, vote and the send/ack cycle. States carry the
//! data they need and nothing else: partial-read buffers for the
//! handshake, verdict and ack records, the in-flight message cursor
//! for sends. All I/O here is a single nonblocking step; the
//! broadcaster decides what a failure means.

use std::io;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};

use tracing::*;

use crate::protocol::{ServerInfo, ACK_SIZE, NODE_ID_SIZE, SERVER_INFO_SIZE};
use crate::sock::{self, Readiness};
use crate::wal_queue::MsgSeq;
use walutils::bin_ser::LeSer;
use walutils::lsn::Lsn;

use crate::protocol::NodeId;

/// Accumulates a fixed-size record across partial reads.
#[derive(Debug)]
pub struct ReadBuf {
    buf: Vec<u8>,
    filled: usize,
}

impl ReadBuf {
    pub fn new(size: usize) -> ReadBuf {
        ReadBuf {
            buf: vec![0; size],
            filled: 0,
        }
    }

    /// Read whatever the socket has; true once the record is complete.
    pub fn fill_from(&mut self, sock: &TcpStream) -> io::Result<bool> {
        self.filled += sock::read_partial(sock, &mut self.buf[self.filled..])?;
        Ok(self.filled == self.buf.len())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

#[derive(Debug)]
pub enum SafekeeperState {
    /// No connection; retried by the event loop.
    Offline,
    /// connect() in flight, completion signalled by writability
    Connecting,
    /// greeting sent, reading the peer's ServerInfo
    Handshake(ReadBuf),
    /// greeting received, waiting for the proposal dispatch
    Vote,
    /// proposal sent, reading the peer's verdict
    WaitVerdict(ReadBuf),
    /// fully joined, nothing in flight
    Idle,
    /// WAL message partially written
    SendWal { msg: MsgSeq, offs: usize },
    /// WAL message written, reading the flush LSN
    RecvAck { msg: MsgSeq, buf: ReadBuf },
}

pub struct Safekeeper {
    pub host: String,
    pub port: u16,
    pub sock: Option<TcpStream>,
    pub state: SafekeeperState,
    /// the peer's greeting, once the handshake completed
    pub info: Option<ServerInfo>,
    /// highest LSN the peer has reported flushed
    pub ack_lsn: Lsn,
}

fn state_error(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, what.to_string())
}

fn decode_error(e: walutils::bin_ser::DeserializeError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

impl Safekeeper {
    pub fn new(host: String, port: u16) -> Safekeeper {
        Safekeeper {
            host,
            port,
            sock: None,
            state: SafekeeperState::Offline,
            info: None,
            ack_lsn: Lsn(0),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn sock(&self) -> io::Result<&TcpStream> {
        self.sock
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket is closed"))
    }

    /// What the event loop should watch this peer's socket for.
    pub fn poll_interest(&self) -> Option<(RawFd, Readiness)> {
        let sock = self.sock.as_ref()?;
        let readiness = match self.state {
            SafekeeperState::Offline => return None,
            SafekeeperState::Connecting => Readiness {
                read: false,
                write: true,
            },
            SafekeeperState::SendWal { .. } => Readiness {
                read: true,
                write: true,
            },
            _ => Readiness {
                read: true,
                write: false,
            },
        };
        Some((sock.as_raw_fd(), readiness))
    }

    /// The message this peer is currently sending or awaiting, if any.
    pub fn current_msg(&self) -> Option<MsgSeq> {
        match self.state {
            SafekeeperState::SendWal { msg, .. } => Some(msg),
            SafekeeperState::RecvAck { msg, .. } => Some(msg),
            _ => None,
        }
    }

    /// Drop the connection, if any, and go Offline.
    pub fn disconnect(&mut self) {
        self.sock = None;
        self.state = SafekeeperState::Offline;
    }

    /// Close the current connection and try to initiate a new one.
    pub fn reset(&mut self, greeting: &[u8]) {
        self.disconnect();
        self.start_connection(greeting);
    }

    /// Initiate a connection; on inline completion the handshake
    /// greeting goes out right away. Failure leaves the peer Offline
    /// for the event loop's next reconnect tick.
    pub fn start_connection(&mut self, greeting: &[u8]) {
        match sock::connect_async(&self.host, self.port) {
            Ok((sock, established)) => {
                info!(
                    "{} to safekeeper {}",
                    if established { "connected" } else { "connecting" },
                    self.addr()
                );
                self.sock = Some(sock);
                if established {
                    if let Err(e) = self.send_handshake(greeting) {
                        info!("handshake with safekeeper {} failed: {}", self.addr(), e);
                        self.disconnect();
                    }
                } else {
                    self.state = SafekeeperState::Connecting;
                }
            }
            Err(e) => {
                info!("could not connect to safekeeper {}: {}", self.addr(), e);
            }
        }
    }

    /// A pending connect became writable: check SO_ERROR and start the
    /// handshake on success.
    pub fn complete_connection(&mut self, greeting: &[u8]) -> io::Result<()> {
        sock::check_connect_result(self.sock()?)?;
        info!("connected to safekeeper {}", self.addr());
        self.send_handshake(greeting)
    }

    fn send_handshake(&mut self, greeting: &[u8]) -> io::Result<()> {
        sock::write_all(self.sock()?, greeting)?;
        self.state = SafekeeperState::Handshake(ReadBuf::new(SERVER_INFO_SIZE));
        Ok(())
    }

    /// Continue reading the peer's greeting; `Some` once complete.
    pub fn read_greeting(&mut self) -> io::Result<Option<ServerInfo>> {
        let sock = match &self.sock {
            Some(s) => s,
            None => return Err(state_error("reading greeting without a socket")),
        };
        let buf = match &mut self.state {
            SafekeeperState::Handshake(buf) => buf,
            _ => return Err(state_error("reading greeting in wrong state")),
        };
        if !buf.fill_from(sock)? {
            return Ok(None);
        }
        let info = ServerInfo::des(buf.bytes()).map_err(decode_error)?;
        self.info = Some(info);
        self.ack_lsn = info.wal_end;
        self.state = SafekeeperState::Vote;
        Ok(Some(info))
    }

    /// Send the elected candidate to a peer in Vote.
    pub fn send_proposal(&mut self, proposal: &[u8]) -> io::Result<()> {
        sock::write_all(self.sock()?, proposal)?;
        self.state = SafekeeperState::WaitVerdict(ReadBuf::new(NODE_ID_SIZE));
        Ok(())
    }

    /// Continue reading the vote verdict; `Some` once complete. The
    /// peer moves to Idle; the broadcaster judges the verdict.
    pub fn read_verdict(&mut self) -> io::Result<Option<NodeId>> {
        let sock = match &self.sock {
            Some(s) => s,
            None => return Err(state_error("reading verdict without a socket")),
        };
        let buf = match &mut self.state {
            SafekeeperState::WaitVerdict(buf) => buf,
            _ => return Err(state_error("reading verdict in wrong state")),
        };
        if !buf.fill_from(sock)? {
            return Ok(None);
        }
        let verdict = NodeId::des(buf.bytes()).map_err(decode_error)?;
        self.state = SafekeeperState::Idle;
        Ok(Some(verdict))
    }

    /// Start sending a WAL message from Idle.
    pub fn start_send(&mut self, seq: MsgSeq, data: &[u8]) -> io::Result<()> {
        let n = sock::write_partial(self.sock()?, data)?;
        if n == data.len() {
            self.state = SafekeeperState::RecvAck {
                msg: seq,
                buf: ReadBuf::new(ACK_SIZE),
            };
        } else {
            self.state = SafekeeperState::SendWal { msg: seq, offs: n };
        }
        Ok(())
    }

    /// The socket became writable mid-send: push more bytes out.
    pub fn continue_send(&mut self, data: &[u8]) -> io::Result<()> {
        let (seq, offs) = match self.state {
            SafekeeperState::SendWal { msg, offs } => (msg, offs),
            _ => return Err(state_error("continuing send in wrong state")),
        };
        let n = sock::write_partial(self.sock()?, &data[offs..])?;
        if offs + n == data.len() {
            self.state = SafekeeperState::RecvAck {
                msg: seq,
                buf: ReadBuf::new(ACK_SIZE),
            };
        } else {
            self.state = SafekeeperState::SendWal {
                msg: seq,
                offs: offs + n,
            };
        }
        Ok(())
    }

    /// Continue reading the flushed-LSN response; `Some((msg, lsn))`
    /// once complete, with the peer back in Idle.
    pub fn read_ack(&mut self) -> io::Result<Option<(MsgSeq, Lsn)>> {
        let sock = match &self.sock {
            Some(s) => s,
            None => return Err(state_error("reading ack without a socket")),
        };
        let (seq, buf) = match &mut self.state {
            SafekeeperState::RecvAck { msg, buf } => (*msg, buf),
            _ => return Err(state_error("reading ack in wrong state")),
        };
        if !buf.fill_from(sock)? {
            return Ok(None);
        }
        let lsn = u64::des(buf.bytes()).map_err(decode_error)?;
        self.state = SafekeeperState::Idle;
        Ok(Some((seq, Lsn(lsn))))
    }

    /// Send the quit record and drop the connection. Errors are moot,
    /// we are shutting down.
    pub fn send_quit(&mut self, quit: &[u8]) {
        if let Some(sock) = &self.sock {
            if let Err(e) = sock::write_all(sock, quit) {
                debug!("failed to send quit to safekeeper {}: {}", self.addr(), e);
            }
        }
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_disconnect_is_safe_from_any_state() {
        let states = vec![
            SafekeeperState::Offline,
            SafekeeperState::Connecting,
            SafekeeperState::Handshake(ReadBuf::new(SERVER_INFO_SIZE)),
            SafekeeperState::Vote,
            SafekeeperState::WaitVerdict(ReadBuf::new(NODE_ID_SIZE)),
            SafekeeperState::Idle,
            SafekeeperState::SendWal { msg: 3, offs: 17 },
            SafekeeperState::RecvAck {
                msg: 3,
                buf: ReadBuf::new(ACK_SIZE),
            },
        ];
        for state in states {
            let mut sk = Safekeeper::new("localhost".to_owned(), 1);
            if !matches!(state, SafekeeperState::Offline) {
                let (client, _server) = connected_pair();
                sk.sock = Some(client);
            }
            sk.state = state;
            sk.disconnect();
            assert!(sk.sock.is_none());
            assert!(matches!(sk.state, SafekeeperState::Offline));
            assert!(sk.poll_interest().is_none());
        }
    }

    #[test]
    fn test_greeting_read_resumes_across_partial_reads() {
        use std::io::Write;

        let (client, mut server) = connected_pair();
        let mut sk = Safekeeper::new("localhost".to_owned(), 1);
        sk.sock = Some(client);
        sk.state = SafekeeperState::Handshake(ReadBuf::new(SERVER_INFO_SIZE));

        let info = ServerInfo {
            protocol_version: crate::protocol::SK_PROTOCOL_VERSION,
            pg_version: 140005,
            system_id: 42,
            wal_seg_size: 16 * 1024 * 1024,
            timeline: 1,
            wal_end: Lsn(0x500),
            node_id: NodeId {
                term: 4,
                uuid: [11; 16],
            },
        };
        let encoded = info.ser().unwrap();

        // a prefix of the record cannot complete the read
        server.write_all(&encoded[..20]).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(sk.read_greeting().unwrap().is_none());
        assert!(matches!(sk.state, SafekeeperState::Handshake(_)));

        server.write_all(&encoded[20..]).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let received = loop {
            assert!(Instant::now() < deadline, "greeting never completed");
            match sk.read_greeting().unwrap() {
                Some(info) => break info,
                None => thread::sleep(Duration::from_millis(10)),
            }
        };
        assert_eq!(received, info);
        assert_eq!(sk.ack_lsn, Lsn(0x500));
        assert!(matches!(sk.state, SafekeeperState::Vote));
    }
}
