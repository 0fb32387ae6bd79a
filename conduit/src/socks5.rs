//! Wire codec for SOCKS5 method negotiation and CONNECT (RFC 1928), plus the
//! shadowsocks address header, which reuses the SOCKS5 address encoding
//! (`ATYP | ADDR | PORT`). All parsers operate on the head of a link buffer
//! and report a short buffer as [`NetworkError::Wait`] so the engine can
//! re-read instead of failing the link.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::str;

use crate::shared::{ErrorType, NetworkError, NetworkResult};

pub const VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_REJECTED: u8 = 0xff;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Origin endpoint addressed by a shadowsocks header.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Destination {
    Ip(IpAddr, u16),
    Domain(String, u16),
}

impl Destination {
    /// Resolves the destination into an ordered candidate list.
    pub fn resolve(&self) -> NetworkResult<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = match self {
            Destination::Ip(ip, port) => vec![SocketAddr::new(*ip, *port)],
            Destination::Domain(host, port) => (host.as_str(), *port)
                .to_socket_addrs()
                .map_err(|_| NetworkError::Fatal(ErrorType::Resolve))?
                .collect(),
        };

        if addrs.is_empty() {
            return Err(NetworkError::Fatal(ErrorType::Resolve));
        }

        Ok(addrs)
    }
}

/// Validates a SOCKS5 method negotiation request
/// (`VER | NMETHODS | METHODS`). The request must contain exactly
/// `NMETHODS + 2` bytes and offer the "no authentication" method.
pub fn parse_auth_request(buf: &[u8]) -> NetworkResult<()> {
    if buf.len() < 2 {
        return Err(NetworkError::Wait);
    }

    if buf[0] != VERSION {
        return Err(NetworkError::Fatal(ErrorType::Protocol));
    }

    let nmethods = buf[1] as usize;

    if buf.len() < nmethods + 2 {
        return Err(NetworkError::Wait);
    }

    if buf.len() > nmethods + 2 {
        return Err(NetworkError::Fatal(ErrorType::Protocol));
    }

    if buf[2..2 + nmethods].contains(&METHOD_NO_AUTH) {
        Ok(())
    } else {
        Err(NetworkError::Fatal(ErrorType::Unsupported))
    }
}

/// The fixed two-byte method negotiation reply.
#[inline]
pub fn auth_reply(ok: bool) -> [u8; 2] {
    let method = if ok { METHOD_NO_AUTH } else { METHOD_REJECTED };
    [VERSION, method]
}

/// Parsed SOCKS5 CONNECT request. `header_len` is the length of the
/// `ATYP | ADDR | PORT` tail, which doubles as the shadowsocks header once
/// the `VER | CMD | RSV` triple is stripped.
#[derive(Debug, PartialEq)]
pub struct CmdRequest {
    pub destination: Destination,
    pub header_len: usize,
}

/// Parses a SOCKS5 command request
/// (`VER | CMD | RSV | ATYP | ADDR | PORT`). Only CONNECT is supported;
/// UDP ASSOCIATE is recognized and rejected as `Unsupported`. Bytes beyond
/// the header are early payload and are left untouched.
pub fn parse_cmd_request(buf: &[u8]) -> NetworkResult<CmdRequest> {
    if buf.len() < 4 {
        return Err(NetworkError::Wait);
    }

    if buf[0] != VERSION {
        return Err(NetworkError::Fatal(ErrorType::Protocol));
    }

    match buf[1] {
        CMD_CONNECT => (),
        CMD_UDP_ASSOCIATE => return Err(NetworkError::Fatal(ErrorType::Unsupported)),
        _ => return Err(NetworkError::Fatal(ErrorType::Protocol)),
    }

    if buf[2] != 0x00 {
        return Err(NetworkError::Fatal(ErrorType::Protocol));
    }

    let (destination, header_len) = parse_address(&buf[3..])?;

    Ok(CmdRequest {
        destination,
        header_len,
    })
}

/// Parses a shadowsocks address header (`ATYP | ADDR | PORT`), returning the
/// destination and the header length in bytes.
pub fn parse_address(buf: &[u8]) -> NetworkResult<(Destination, usize)> {
    if buf.is_empty() {
        return Err(NetworkError::Wait);
    }

    match buf[0] {
        ATYP_IPV4 => {
            // atyp(1) + ipv4(4) + port(2)
            if buf.len() < 7 {
                return Err(NetworkError::Wait);
            }

            let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
            let port = BigEndian::read_u16(&buf[5..7]);

            Ok((Destination::Ip(ip.into(), port), 7))
        }
        ATYP_DOMAIN => {
            if buf.len() < 2 {
                return Err(NetworkError::Wait);
            }

            // atyp(1) + addr_size(1) + domain(len) + port(2)
            let len = buf[1] as usize;
            if buf.len() < 2 + len + 2 {
                return Err(NetworkError::Wait);
            }

            let host = str::from_utf8(&buf[2..2 + len])
                .map_err(|_| NetworkError::Fatal(ErrorType::Protocol))?
                .to_owned();
            let port = BigEndian::read_u16(&buf[2 + len..4 + len]);

            Ok((Destination::Domain(host, port), 1 + 1 + len + 2))
        }
        ATYP_IPV6 => {
            // atyp(1) + ipv6(16) + port(2)
            if buf.len() < 19 {
                return Err(NetworkError::Wait);
            }

            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[1..17]);
            let port = BigEndian::read_u16(&buf[17..19]);

            Ok((Destination::Ip(Ipv6Addr::from(octets).into(), port), 19))
        }
        _ => Err(NetworkError::Fatal(ErrorType::Protocol)),
    }
}

/// Emits a SOCKS5 command reply with BND populated from `bnd`.
pub fn cmd_reply(rep: u8, bnd: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(22);

    out.push(VERSION);
    out.push(rep);
    out.push(0x00);

    match bnd {
        SocketAddr::V4(addr) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&addr.ip().octets());
        }
    }

    out.write_u16::<BigEndian>(bnd.port())
        .expect("Error writing reply port");

    out
}
