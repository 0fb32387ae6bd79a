use lodestone::crypto::{self, StreamCtx, IV_SIZE, KEY_SIZE};
use mio::net::TcpStream;
use mio::Token;
use std::cmp;
use std::net::{Shutdown, SocketAddr};
use std::time::Instant;

use crate::buffer::Buffer;

/// Plaintext buffer capacity of a link.
pub const TEXT_BUF_SIZE: usize = 16 * 1024;
/// Ciphertext buffer capacity; holds a fully encrypted plaintext buffer
/// plus the leading IV.
pub const CIPHER_BUF_SIZE: usize = TEXT_BUF_SIZE + IV_SIZE;

pub type LinkId = usize;

/// Which half of the proxy pair this process is. The local role speaks
/// SOCKS5 to clients; the server role connects to origins.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Local,
    Server,
}

/// The two sockets of a link. `Local` is always the accepted socket,
/// `Server` the outbound one (the server proxy or the origin).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Side {
    Local,
    Server,
}

impl Side {
    #[inline]
    pub fn other(self) -> Side {
        match self {
            Side::Local => Side::Server,
            Side::Server => Side::Local,
        }
    }
}

/// Negotiation progression of a link. Phases only ever advance.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    /// Local role: waiting for the SOCKS5 method negotiation request.
    AwaitAuth,
    /// Local role: auth reply queued, waiting for the CONNECT request.
    AwaitCommand,
    /// Server role: waiting for the decrypted shadowsocks address header.
    AwaitHeader,
    /// Upstream connect in flight.
    Connecting,
    /// Payload is relayed in both directions.
    Established,
    /// The slot is free.
    Closed,
}

/// Maps a link socket to its poll token. Token 0 is reserved for the
/// listener, so link tokens start at 1.
#[inline]
pub fn token(id: LinkId, side: Side) -> Token {
    let side_bit = match side {
        Side::Local => 0,
        Side::Server => 1,
    };
    Token(1 + id * 2 + side_bit)
}

/// Inverse of [`token`].
#[inline]
pub fn split_token(token: Token) -> (LinkId, Side) {
    let index = token.0 - 1;
    let side = if index % 2 == 0 { Side::Local } else { Side::Server };
    (index / 2, side)
}

/// A full-duplex connection record joining the accepted socket and the
/// upstream socket, plus the buffer pair, the per-direction cipher contexts
/// and the negotiation state.
///
/// `text` is the plaintext queue toward the plaintext-carrying socket and
/// `cipher` the ciphertext queue toward the encrypted one. Bytes read off
/// either socket are staged at the tail of the corresponding buffer and
/// moved through the cipher to their queue within the same event, so each
/// buffer has exactly one persistent producer and one consumer.
pub struct Link {
    pub(crate) role: Role,
    pub(crate) phase: Phase,

    pub(crate) local: Option<TcpStream>,
    pub(crate) server: Option<TcpStream>,
    pub(crate) server_connected: bool,

    pub(crate) text: Buffer,
    pub(crate) cipher: Buffer,

    pub(crate) ss_header_len: usize,
    pub(crate) remote_addrs: Vec<SocketAddr>,

    pub(crate) encrypt: Option<StreamCtx>,
    pub(crate) decrypt: Option<StreamCtx>,
    pub(crate) iv_sent: bool,
    pub(crate) iv_received: bool,
    iv_buf: [u8; IV_SIZE],
    iv_fill: usize,

    pub(crate) last_activity: Instant,
}

impl Link {
    pub fn new() -> Link {
        Link {
            role: Role::Local,
            phase: Phase::Closed,
            local: None,
            server: None,
            server_connected: false,
            text: Buffer::new(TEXT_BUF_SIZE),
            cipher: Buffer::new(CIPHER_BUF_SIZE),
            ss_header_len: 0,
            remote_addrs: Vec::new(),
            encrypt: None,
            decrypt: None,
            iv_sent: false,
            iv_received: false,
            iv_buf: [0; IV_SIZE],
            iv_fill: 0,
            last_activity: Instant::now(),
        }
    }

    /// Binds a freshly accepted socket to this slot. The slot must be free.
    pub fn open(&mut self, role: Role, stream: TcpStream, now: Instant) {
        if self.phase != Phase::Closed {
            panic!("Attempted to open a link slot that is still in use");
        }

        self.role = role;
        self.phase = match role {
            Role::Local => Phase::AwaitAuth,
            Role::Server => Phase::AwaitHeader,
        };
        self.local = Some(stream);
        self.last_activity = now;
    }

    /// Shuts both sockets down and clears all per-connection state so the
    /// slot can be reused.
    pub fn close(&mut self) {
        if let Some(stream) = self.local.take() {
            stream.shutdown(Shutdown::Both).ok();
        }
        if let Some(stream) = self.server.take() {
            stream.shutdown(Shutdown::Both).ok();
        }

        self.phase = Phase::Closed;
        self.server_connected = false;
        self.text.clear();
        self.cipher.clear();
        self.ss_header_len = 0;
        self.remote_addrs.clear();
        self.encrypt = None;
        self.decrypt = None;
        self.iv_sent = false;
        self.iv_received = false;
        self.iv_fill = 0;
    }

    #[inline]
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// The side whose socket carries plaintext: the client for the local
    /// role, the origin for the server role.
    #[inline]
    pub fn plain_side(&self) -> Side {
        match self.role {
            Role::Local => Side::Local,
            Role::Server => Side::Server,
        }
    }

    /// The side whose socket carries the encrypted stream.
    #[inline]
    pub fn enc_side(&self) -> Side {
        self.plain_side().other()
    }

    /// IV bytes still missing from the receiving direction.
    #[inline]
    pub(crate) fn iv_remaining(&self) -> usize {
        if self.iv_received {
            0
        } else {
            IV_SIZE - self.iv_fill
        }
    }

    #[inline]
    pub fn stream(&self, side: Side) -> Option<&TcpStream> {
        match side {
            Side::Local => self.local.as_ref(),
            Side::Server => self.server.as_ref(),
        }
    }

    /// Encrypts the `count` bytes staged at the tail of `text` and moves
    /// them to the ciphertext queue. The first call generates the IV,
    /// initializes the encrypt context and prepends the IV to the queue.
    pub(crate) fn encrypt_tail(&mut self, key: &[u8; KEY_SIZE], count: usize) {
        if !self.iv_sent {
            let iv = crypto::random_iv();
            self.encrypt = Some(StreamCtx::new(key, &iv));
            self.cipher.prepend(&iv);
            self.iv_sent = true;
        }

        let start = self.text.len() - count;
        let ctx = self.encrypt.as_mut().expect("Encrypt context must be initialized");
        ctx.apply(&mut self.text.data_slice()[start..]);

        self.cipher.append(&self.text.read_slice()[start..]);
        self.text.truncate(start);
    }

    /// Decrypts the `count` bytes staged at the tail of `cipher` (which
    /// begins at offset `start`) and moves the plaintext to `text`. Leading
    /// bytes fill the IV accumulator first; the decrypt context is only
    /// initialized once all of the IV has arrived, however many reads that
    /// takes.
    pub(crate) fn decrypt_tail(&mut self, key: &[u8; KEY_SIZE], start: usize, count: usize) {
        let mut offset = start;

        if !self.iv_received {
            let take = cmp::min(IV_SIZE - self.iv_fill, count);
            let fill = self.iv_fill;
            self.iv_buf[fill..fill + take]
                .copy_from_slice(&self.cipher.read_slice()[offset..offset + take]);
            self.iv_fill += take;

            if self.iv_fill == IV_SIZE {
                self.decrypt = Some(StreamCtx::new(key, &self.iv_buf));
                self.iv_received = true;
            }

            offset += take;

            if offset == start + count {
                self.cipher.truncate(start);
                return;
            }
        }

        let end = start + count;
        let ctx = self.decrypt.as_mut().expect("Decrypt context must be initialized");
        ctx.apply(&mut self.cipher.data_slice()[offset..end]);

        let payload_start = offset - start;
        let staged = &self.cipher.read_slice()[start..end];
        self.text.append(&staged[payload_start..]);
        self.cipher.truncate(start);
    }
}
