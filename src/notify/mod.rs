//! Destination-notification pipe protocol
//!
//! The tracer rewrites a traced process's `connect()` to point at our
//! listener and tells us the original destination through a named pipe.
//! Records are fixed-layout binary, version 1, all multi-byte fields
//! big-endian:
//!
//! ```text
//! offset  size  field
//! 0       1     version (0x01)
//! 1       1     address family: 0x01 = IPv4, 0x04 = IPv6
//! 2       2     correlation key (source port of the redirected socket)
//! 4       4     pid of the traced process
//! 8       4     intercepted file descriptor
//! 12      2     original destination port (zero is invalid)
//! 14      4|16  original destination IP, length per family
//! ```
//!
//! Any mismatch with the tracer here is a silent wrong-destination bug, not
//! a crash, so every field is validated and the version byte is checked on
//! every record.

mod reader;

pub use reader::NotificationReader;

use crate::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio_util::codec::{Decoder, Encoder};

/// Protocol version byte
pub const RECORD_VERSION: u8 = 0x01;

/// Address family markers (SOCKS-style atyp values)
pub const FAMILY_IPV4: u8 = 0x01;
pub const FAMILY_IPV6: u8 = 0x04;

/// Fixed part of a record, before the address bytes
const HEADER_LEN: usize = 14;

/// One intercepted connect attempt, as reported by the tracer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestNotification {
    /// Correlation key: the redirected socket's source port. The dispatcher
    /// recomputes the same value from the accepted connection's peer
    /// address, so both sides derive it independently.
    pub key: u16,

    /// Pid of the traced process
    pub pid: u32,

    /// File descriptor of the intercepted socket inside that process
    pub fd: u32,

    /// The destination the process actually asked for
    pub dest: SocketAddr,
}

impl fmt::Display for DestNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pid {} fd {} key {} -> {}",
            self.pid, self.fd, self.key, self.dest
        )
    }
}

/// Codec for the notification record stream
#[derive(Debug, Default)]
pub struct NotifyCodec;

impl Decoder for NotifyCodec {
    type Item = DestNotification;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DestNotification>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let version = src[0];
        if version != RECORD_VERSION {
            return Err(Error::protocol(format!(
                "unsupported notification record version: {:#04x}",
                version
            )));
        }

        let addr_len = match src[1] {
            FAMILY_IPV4 => 4,
            FAMILY_IPV6 => 16,
            family => {
                return Err(Error::protocol(format!(
                    "invalid address family: {:#04x}",
                    family
                )))
            }
        };

        if src.len() < HEADER_LEN + addr_len {
            src.reserve(HEADER_LEN + addr_len - src.len());
            return Ok(None);
        }

        let mut record = src.split_to(HEADER_LEN + addr_len);
        record.advance(2); // version + family already inspected
        let key = record.get_u16();
        let pid = record.get_u32();
        let fd = record.get_u32();
        let port = record.get_u16();

        if port == 0 {
            return Err(Error::protocol(format!(
                "zero destination port in record for pid {}",
                pid
            )));
        }

        let ip: IpAddr = if addr_len == 4 {
            let mut octets = [0u8; 4];
            record.copy_to_slice(&mut octets);
            Ipv4Addr::from(octets).into()
        } else {
            let mut octets = [0u8; 16];
            record.copy_to_slice(&mut octets);
            Ipv6Addr::from(octets).into()
        };

        Ok(Some(DestNotification {
            key,
            pid,
            fd,
            dest: SocketAddr::new(ip, port),
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<DestNotification>> {
        match self.decode(src)? {
            Some(record) => Ok(Some(record)),
            None if src.is_empty() => Ok(None),
            None => Err(Error::protocol(format!(
                "truncated record at end of stream ({} trailing bytes)",
                src.len()
            ))),
        }
    }
}

impl Encoder<DestNotification> for NotifyCodec {
    type Error = Error;

    fn encode(&mut self, item: DestNotification, dst: &mut BytesMut) -> Result<()> {
        let (family, addr_len) = match item.dest.ip() {
            IpAddr::V4(_) => (FAMILY_IPV4, 4),
            IpAddr::V6(_) => (FAMILY_IPV6, 16),
        };
        dst.reserve(HEADER_LEN + addr_len);
        dst.put_u8(RECORD_VERSION);
        dst.put_u8(family);
        dst.put_u16(item.key);
        dst.put_u32(item.pid);
        dst.put_u32(item.fd);
        dst.put_u16(item.dest.port());
        match item.dest.ip() {
            IpAddr::V4(ip) => dst.put_slice(&ip.octets()),
            IpAddr::V6(ip) => dst.put_slice(&ip.octets()),
        }
        Ok(())
    }
}
