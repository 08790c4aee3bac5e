//! Replication-protocol client for the primary server.
//!
//! Speaks just enough of the v3 wire protocol to own a physical
//! replication session: startup and password authentication, simple
//! queries (`IDENTIFY_SYSTEM`, `SHOW`), `START_REPLICATION`, and the
//! copy-both stream that follows. During streaming the socket is
//! nonblocking and lives in the broadcaster's readiness set; inbound
//! frames are reassembled incrementally so the event loop never stalls
//! on a half-received message.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};

use anyhow::{anyhow, bail, ensure, Context, Result};
use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::*;

use crate::protocol;
use crate::sock;
use crate::SafekeeperProxyConf;
use walutils::lsn::Lsn;

/// Result of `IDENTIFY_SYSTEM`.
pub struct IdentifySystem {
    pub system_id: u64,
    pub timeline: u32,
    pub xlogpos: Lsn,
    pub dbname: Option<String>,
}

/// One message out of the copy-both stream.
pub enum ReplMessage {
    /// a `w` frame, header included, ready for the broadcast queue
    Wal(BytesMut),
    /// the server finished or failed the stream
    StreamEnd,
}

pub struct WalReceiver {
    stream: TcpStream,
    /// reassembly buffer for the nonblocking streaming phase
    inbuf: BytesMut,
}

impl WalReceiver {
    /// Connect and authenticate. The socket stays in blocking mode
    /// until streaming starts; everything here happens once per run.
    pub fn connect(conf: &SafekeeperProxyConf) -> Result<WalReceiver> {
        let stream = TcpStream::connect((conf.host.as_str(), conf.port)).with_context(|| {
            format!("could not connect to server at {}:{}", conf.host, conf.port)
        })?;
        stream.set_nodelay(true)?;
        let mut receiver = WalReceiver {
            stream,
            inbuf: BytesMut::new(),
        };
        receiver.startup(conf)?;
        info!("connected to server at {}:{}", conf.host, conf.port);
        Ok(receiver)
    }

    fn startup(&mut self, conf: &SafekeeperProxyConf) -> Result<()> {
        let mut buf = BytesMut::new();
        buf.put_u32(0); /* length, patched below */
        buf.put_u32(196608); /* protocol 3.0 */
        for (name, value) in &[
            ("user", conf.user.as_str()),
            ("replication", "true"),
            ("application_name", "safekeeper_proxy"),
        ] {
            buf.put_slice(name.as_bytes());
            buf.put_u8(0);
            buf.put_slice(value.as_bytes());
            buf.put_u8(0);
        }
        buf.put_u8(0);
        let len = buf.len() as u32;
        BigEndian::write_u32(&mut buf[0..4], len);
        self.stream.write_all(&buf)?;

        loop {
            let (tag, mut body) = self.read_message()?;
            match tag {
                b'R' => {
                    let code = body.get_u32();
                    match code {
                        0 => {} /* AuthenticationOk */
                        3 => {
                            let password = required_password(conf)?.to_owned();
                            self.send_password(&password)?;
                        }
                        5 => {
                            ensure!(body.remaining() >= 4, "md5 auth request without salt");
                            let mut salt = [0u8; 4];
                            salt.copy_from_slice(&body[..4]);
                            let hashed = md5_password(&conf.user, required_password(conf)?, &salt);
                            self.send_password(&hashed)?;
                        }
                        code => bail!("unsupported authentication request {}", code),
                    }
                }
                b'S' | b'K' | b'N' => {}
                b'E' => bail!("could not authenticate: {}", error_message(&body)),
                b'Z' => return Ok(()),
                tag => bail!("unexpected message '{}' during startup", tag as char),
            }
        }
    }

    fn send_password(&mut self, password: &str) -> Result<()> {
        let mut buf = BytesMut::new();
        buf.put_u8(b'p');
        buf.put_u32((4 + password.len() + 1) as u32);
        buf.put_slice(password.as_bytes());
        buf.put_u8(0);
        Ok(self.stream.write_all(&buf)?)
    }

    /// Read one backend message; blocking, startup phase only.
    fn read_message(&mut self) -> Result<(u8, Bytes)> {
        let mut hdr = [0u8; 5];
        self.stream.read_exact(&mut hdr)?;
        let len = BigEndian::read_u32(&hdr[1..]) as usize;
        ensure!(len >= 4, "invalid message length {}", len);
        let mut body = vec![0u8; len - 4];
        self.stream.read_exact(&mut body)?;
        Ok((hdr[0], Bytes::from(body)))
    }

    fn send_query(&mut self, query: &str) -> Result<()> {
        let mut buf = BytesMut::new();
        buf.put_u8(b'Q');
        buf.put_u32((4 + query.len() + 1) as u32);
        buf.put_slice(query.as_bytes());
        buf.put_u8(0);
        Ok(self.stream.write_all(&buf)?)
    }

    /// Run a simple query and collect the data rows.
    fn simple_query(&mut self, query: &str) -> Result<Vec<Vec<Option<Bytes>>>> {
        debug!("sending query: {}", query);
        self.send_query(query)?;
        let mut rows = Vec::new();
        loop {
            let (tag, mut body) = self.read_message()?;
            match tag {
                b'T' | b'C' | b'N' | b'S' => {}
                b'D' => {
                    let ncols = body.get_u16();
                    let mut row = Vec::with_capacity(ncols as usize);
                    for _ in 0..ncols {
                        let len = body.get_i32();
                        if len < 0 {
                            row.push(None);
                        } else {
                            ensure!(body.remaining() >= len as usize, "malformed DataRow");
                            row.push(Some(body.split_to(len as usize)));
                        }
                    }
                    rows.push(row);
                }
                b'E' => bail!("query \"{}\" failed: {}", query, error_message(&body)),
                b'Z' => return Ok(rows),
                tag => bail!(
                    "unexpected message '{}' in response to \"{}\"",
                    tag as char,
                    query
                ),
            }
        }
    }

    pub fn identify_system(&mut self) -> Result<IdentifySystem> {
        let rows = self.simple_query("IDENTIFY_SYSTEM")?;
        let row = rows
            .get(0)
            .ok_or_else(|| anyhow!("IDENTIFY_SYSTEM returned no rows"))?;
        ensure!(row.len() >= 4, "IDENTIFY_SYSTEM returned {} columns", row.len());

        let text = |col: &Option<Bytes>, what: &str| -> Result<String> {
            let bytes = col
                .as_ref()
                .ok_or_else(|| anyhow!("IDENTIFY_SYSTEM returned null {}", what))?;
            Ok(std::str::from_utf8(bytes)?.to_owned())
        };
        let system_id = text(&row[0], "systemid")?
            .parse()
            .context("could not parse system identifier")?;
        let timeline = text(&row[1], "timeline")?
            .parse()
            .context("could not parse timeline id")?;
        let xlogpos_str = text(&row[2], "xlogpos")?;
        let xlogpos = xlogpos_str
            .parse()
            .map_err(|_| anyhow!("could not parse xlogpos \"{}\"", xlogpos_str))?;
        let dbname = match &row[3] {
            Some(bytes) => Some(std::str::from_utf8(bytes)?.to_owned()),
            None => None,
        };
        Ok(IdentifySystem {
            system_id,
            timeline,
            xlogpos,
            dbname,
        })
    }

    fn show(&mut self, name: &str) -> Result<String> {
        let rows = self.simple_query(&format!("SHOW {}", name))?;
        let value = rows
            .get(0)
            .and_then(|row| row.get(0))
            .and_then(|col| col.as_ref())
            .ok_or_else(|| anyhow!("SHOW {} returned nothing", name))?;
        Ok(std::str::from_utf8(value)?.to_owned())
    }

    /// Determine the remote server's WAL segment size.
    pub fn wal_seg_size(&mut self) -> Result<u32> {
        let value = self.show("wal_segment_size")?;
        parse_wal_seg_size(&value)
    }

    pub fn server_version_num(&mut self) -> Result<u32> {
        let value = self.show("server_version_num")?;
        value
            .parse()
            .with_context(|| format!("could not parse server version \"{}\"", value))
    }

    /// Initiate the replication stream at the specified location and
    /// hand the socket over to the event loop (nonblocking from here).
    pub fn start_replication(&mut self, start: Lsn, timeline: u32) -> Result<()> {
        let query = format!("START_REPLICATION {} TIMELINE {}", start, timeline);
        info!("{}", query);
        self.send_query(&query)?;
        loop {
            let (tag, body) = self.read_message()?;
            match tag {
                b'W' => break, /* CopyBothResponse */
                b'N' | b'S' => {}
                b'E' => bail!(
                    "could not send replication command \"START_REPLICATION\": {}",
                    error_message(&body)
                ),
                tag => bail!(
                    "unexpected message '{}' in response to START_REPLICATION",
                    tag as char
                ),
            }
        }
        self.stream.set_nonblocking(true)?;
        Ok(())
    }

    /// Pull the next message out of the copy-both stream without
    /// blocking. `None` means the socket has no complete frame yet;
    /// wait for readability and call again.
    pub fn poll_message(&mut self) -> Result<Option<ReplMessage>> {
        loop {
            if let Some((tag, frame)) = take_frame(&mut self.inbuf)? {
                match tag {
                    b'd' => match frame.first() {
                        Some(&b'w') => return Ok(Some(ReplMessage::Wal(frame))),
                        Some(&b'k') => trace!("keepalive from the server"),
                        Some(&tag) => bail!("unexpected copy-data tag '{}'", tag as char),
                        None => bail!("empty copy-data frame"),
                    },
                    b'c' => {
                        info!("end of WAL stream reached");
                        return Ok(Some(ReplMessage::StreamEnd));
                    }
                    b'E' => {
                        error!("could not read COPY data: {}", error_message(&frame));
                        return Ok(Some(ReplMessage::StreamEnd));
                    }
                    /* CommandComplete etc. trailing a CopyDone */
                    _ => {}
                }
                continue;
            }

            let mut chunk = [0u8; 16 * 1024];
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    info!("end of WAL stream reached");
                    return Ok(Some(ReplMessage::StreamEnd));
                }
                Ok(n) => self.inbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e).context("error reading from the server"),
            }
        }
    }

    /// Send a Standby Status Update reporting the quorum-acknowledged
    /// position.
    pub fn send_status_update(&mut self, ack: Lsn) -> Result<()> {
        debug!("confirming WAL up to {}", ack);
        let mut buf = BytesMut::new();
        buf.put_u8(b'd');
        buf.put_u32((4 + protocol::feedback_body_size()) as u32);
        protocol::write_feedback_body(&mut buf, ack, protocol::current_timestamp());
        sock::write_all(&self.stream, &buf)?;
        Ok(())
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Split one complete protocol frame off the front of `inbuf`, tag and
/// body, or report that more bytes are needed.
fn take_frame(inbuf: &mut BytesMut) -> Result<Option<(u8, BytesMut)>> {
    if inbuf.len() < 5 {
        return Ok(None);
    }
    let len = BigEndian::read_u32(&inbuf[1..5]) as usize;
    ensure!(len >= 4, "invalid frame length {}", len);
    if inbuf.len() < 1 + len {
        return Ok(None);
    }
    let mut frame = inbuf.split_to(1 + len);
    let tag = frame[0];
    frame.advance(5);
    Ok(Some((tag, frame)))
}

/// Human-readable part of an ErrorResponse: a list of
/// (field type, cstring) pairs; we want severity and message.
fn error_message(body: &[u8]) -> String {
    let mut fields = body;
    let mut severity = String::new();
    let mut message = String::new();
    while let Some((&code, rest)) = fields.split_first() {
        if code == 0 {
            break;
        }
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let value = String::from_utf8_lossy(&rest[..end]);
        match code {
            b'S' => severity = value.into_owned(),
            b'M' => message = value.into_owned(),
            _ => {}
        }
        fields = &rest[(end + 1).min(rest.len())..];
    }
    if severity.is_empty() {
        message
    } else {
        format!("{}: {}", severity, message)
    }
}

fn required_password(conf: &SafekeeperProxyConf) -> Result<&str> {
    conf.password
        .as_deref()
        .ok_or_else(|| anyhow!("server requested a password, but none was supplied"))
}

fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{}{}", password, user)));
    let mut outer = inner.into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(outer))
}

/// `SHOW wal_segment_size` reports a value with a unit suffix.
fn parse_wal_seg_size(value: &str) -> Result<u32> {
    let digits = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| value.len());
    let (num, unit) = value.split_at(digits);
    let num: u64 = num
        .parse()
        .with_context(|| format!("invalid wal_segment_size \"{}\"", value))?;
    let multiplier: u64 = match unit.trim() {
        "" | "B" => 1,
        "kB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        other => bail!("unrecognized wal_segment_size unit \"{}\"", other),
    };
    let size = num * multiplier;
    ensure!(
        size.is_power_of_two() && (1024 * 1024..=1024 * 1024 * 1024).contains(&size),
        "WAL segment size must be a power of two between 1MB and 1GB, got \"{}\"",
        value
    );
    Ok(size as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wal_seg_size() {
        assert_eq!(parse_wal_seg_size("16MB").unwrap(), 16 * 1024 * 1024);
        assert_eq!(parse_wal_seg_size("1GB").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_wal_seg_size("2048kB").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_wal_seg_size("1048576B").unwrap(), 1024 * 1024);

        parse_wal_seg_size("0MB").unwrap_err();
        parse_wal_seg_size("3MB").unwrap_err(); /* not a power of two */
        parse_wal_seg_size("512kB").unwrap_err(); /* below 1MB */
        parse_wal_seg_size("2GB").unwrap_err(); /* above 1GB */
        parse_wal_seg_size("16XB").unwrap_err();
        parse_wal_seg_size("frogs").unwrap_err();
    }

    #[test]
    fn test_take_frame_reassembly() {
        let mut inbuf = BytesMut::new();
        assert!(take_frame(&mut inbuf).unwrap().is_none());

        // a CopyData frame delivered in pieces
        inbuf.extend_from_slice(&[b'd', 0, 0]);
        assert!(take_frame(&mut inbuf).unwrap().is_none());
        inbuf.extend_from_slice(&[0, 9, b'w', 1, 2]);
        assert!(take_frame(&mut inbuf).unwrap().is_none());
        inbuf.extend_from_slice(&[3, 4]);

        let (tag, frame) = take_frame(&mut inbuf).unwrap().unwrap();
        assert_eq!(tag, b'd');
        assert_eq!(&frame[..], &[b'w', 1, 2, 3, 4]);
        assert!(inbuf.is_empty());

        // two frames back to back come out one at a time
        inbuf.extend_from_slice(&[b'd', 0, 0, 0, 5, b'k', b'c', 0, 0, 0, 4]);
        let (tag, frame) = take_frame(&mut inbuf).unwrap().unwrap();
        assert_eq!((tag, &frame[..]), (b'd', &b"k"[..]));
        let (tag, frame) = take_frame(&mut inbuf).unwrap().unwrap();
        assert_eq!((tag, frame.len()), (b'c', 0));

        // garbage length is an error, not a hang
        inbuf.extend_from_slice(&[b'd', 0, 0, 0, 1]);
        take_frame(&mut inbuf).unwrap_err();
    }

    #[test]
    fn test_error_message_fields() {
        let mut body = Vec::new();
        body.extend_from_slice(b"SFATAL\0");
        body.extend_from_slice(b"C28000\0");
        body.extend_from_slice(b"Mrole \"nobody\" does not exist\0");
        body.push(0);
        assert_eq!(
            error_message(&body),
            "FATAL: role \"nobody\" does not exist"
        );
        assert_eq!(error_message(b""), "");
    }

    #[test]
    fn test_md5_password_shape() {
        let hashed = md5_password("alice", "secret", &[1, 2, 3, 4]);
        assert!(hashed.starts_with("md5"));
        assert_eq!(hashed.len(), 3 + 32);
        assert!(hashed[3..].chars().all(|c| c.is_ascii_hexdigit()));
        // salted: a different salt yields a different response
        assert_ne!(hashed, md5_password("alice", "secret", &[4, 3, 2, 1]));
    }
}
