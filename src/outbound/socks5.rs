//! SOCKS5 upstream
//!
//! RFC 1928 client subset: no-auth and username/password (RFC 1929)
//! methods, CONNECT command only. Destinations are always IP literals here,
//! so the domain address type is never sent.

use super::{ConnectError, Upstream};
use crate::config::Socks5Auth;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;

/// Authentication methods
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

/// Commands
const CMD_CONNECT: u8 = 0x01;

/// Address types
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Reply codes
const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CONNECTION_NOT_ALLOWED: u8 = 0x02;
const REP_NETWORK_UNREACHABLE: u8 = 0x03;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_TTL_EXPIRED: u8 = 0x06;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 upstream connector
pub struct Socks5Upstream {
    server: SocketAddr,
    auth: Option<Socks5Auth>,
}

impl Socks5Upstream {
    pub fn new(server: SocketAddr, auth: Option<Socks5Auth>) -> Self {
        Socks5Upstream { server, auth }
    }

    /// Greeting, method negotiation and CONNECT for `dest`.
    async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        dest: SocketAddr,
    ) -> Result<(), ConnectError> {
        // Greeting with the methods we can offer
        let greeting: &[u8] = if self.auth.is_some() {
            &[SOCKS5_VERSION, 2, AUTH_NONE, AUTH_PASSWORD]
        } else {
            &[SOCKS5_VERSION, 1, AUTH_NONE]
        };
        stream
            .write_all(greeting)
            .await
            .map_err(ConnectError::DialFailed)?;

        let mut choice = [0u8; 2];
        stream
            .read_exact(&mut choice)
            .await
            .map_err(ConnectError::DialFailed)?;
        if choice[0] != SOCKS5_VERSION {
            return Err(ConnectError::UpstreamRefused(
                "invalid SOCKS5 version in method choice".into(),
            ));
        }

        match choice[1] {
            AUTH_NONE => {}
            AUTH_PASSWORD => self.authenticate(stream).await?,
            AUTH_NO_ACCEPTABLE => {
                return Err(ConnectError::AuthRejected(
                    "no acceptable authentication method".into(),
                ))
            }
            method => {
                return Err(ConnectError::UpstreamRefused(format!(
                    "unsupported authentication method: {}",
                    method
                )))
            }
        }

        // CONNECT request
        let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
        match dest.ip() {
            IpAddr::V4(ip) => {
                request.push(ATYP_IPV4);
                request.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                request.push(ATYP_IPV6);
                request.extend_from_slice(&ip.octets());
            }
        }
        request.extend_from_slice(&dest.port().to_be_bytes());
        stream
            .write_all(&request)
            .await
            .map_err(ConnectError::DialFailed)?;

        // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
        let mut reply = [0u8; 4];
        stream
            .read_exact(&mut reply)
            .await
            .map_err(ConnectError::DialFailed)?;
        if reply[0] != SOCKS5_VERSION {
            return Err(ConnectError::UpstreamRefused(
                "invalid SOCKS5 version in reply".into(),
            ));
        }
        if reply[1] != REP_SUCCESS {
            return Err(ConnectError::UpstreamRefused(reply_message(reply[1])));
        }

        // Drain the bound address
        match reply[3] {
            ATYP_IPV4 => {
                let mut buf = [0u8; 4 + 2];
                stream
                    .read_exact(&mut buf)
                    .await
                    .map_err(ConnectError::DialFailed)?;
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 16 + 2];
                stream
                    .read_exact(&mut buf)
                    .await
                    .map_err(ConnectError::DialFailed)?;
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream
                    .read_exact(&mut len)
                    .await
                    .map_err(ConnectError::DialFailed)?;
                let mut buf = vec![0u8; len[0] as usize + 2];
                stream
                    .read_exact(&mut buf)
                    .await
                    .map_err(ConnectError::DialFailed)?;
            }
            atyp => {
                return Err(ConnectError::UpstreamRefused(format!(
                    "invalid address type in reply: {}",
                    atyp
                )))
            }
        }

        Ok(())
    }

    /// RFC 1929 username/password subnegotiation
    async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
    ) -> Result<(), ConnectError> {
        let auth = self.auth.as_ref().ok_or_else(|| {
            ConnectError::AuthRejected("server requires credentials, none configured".into())
        })?;

        if auth.username.len() > 255 || auth.password.len() > 255 {
            return Err(ConnectError::AuthRejected(
                "username or password too long".into(),
            ));
        }

        let mut request = vec![0x01, auth.username.len() as u8];
        request.extend_from_slice(auth.username.as_bytes());
        request.push(auth.password.len() as u8);
        request.extend_from_slice(auth.password.as_bytes());
        stream
            .write_all(&request)
            .await
            .map_err(ConnectError::DialFailed)?;

        let mut response = [0u8; 2];
        stream
            .read_exact(&mut response)
            .await
            .map_err(ConnectError::DialFailed)?;
        if response[1] != 0x00 {
            return Err(ConnectError::AuthRejected(
                "server rejected credentials".into(),
            ));
        }
        Ok(())
    }
}

fn reply_message(code: u8) -> String {
    match code {
        REP_GENERAL_FAILURE => "general SOCKS server failure".to_string(),
        REP_CONNECTION_NOT_ALLOWED => "connection not allowed by ruleset".to_string(),
        REP_NETWORK_UNREACHABLE => "network unreachable".to_string(),
        REP_HOST_UNREACHABLE => "host unreachable".to_string(),
        REP_CONNECTION_REFUSED => "connection refused".to_string(),
        REP_TTL_EXPIRED => "TTL expired".to_string(),
        REP_COMMAND_NOT_SUPPORTED => "command not supported".to_string(),
        REP_ADDRESS_TYPE_NOT_SUPPORTED => "address type not supported".to_string(),
        _ => format!("unknown reply code: {}", code),
    }
}

#[async_trait]
impl Upstream for Socks5Upstream {
    fn name(&self) -> &str {
        "socks5"
    }

    async fn connect(&self, dest: SocketAddr) -> Result<TcpStream, ConnectError> {
        debug!("socks5 connecting to {} via {}", dest, self.server);
        let stream = super::bounded(async {
            let mut stream = super::dial(self.server).await?;
            self.handshake(&mut stream, dest).await?;
            Ok(stream)
        })
        .await?;
        debug!("socks5 connected to {}", dest);
        Ok(stream)
    }
}
