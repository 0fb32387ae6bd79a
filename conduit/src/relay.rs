//! The per-connection relay engine: accepts client connections, drives the
//! SOCKS5 negotiation, pipes bytes through the cipher pipeline between the
//! two sockets of each link and tears links down on error or idle timeout.
//! Single-threaded and cooperative; every socket is non-blocking and the
//! only suspension mechanism is the readiness poll.

use indexmap::IndexSet;
use lodestone::config::RelayConfig;
use lodestone::crypto::{IV_SIZE, KEY_SIZE};
use lodestone::logging;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Ready, Token};
use std::cmp;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::link::{self, Link, LinkId, Phase, Role, Side};
use crate::poll::{Poller, LISTENER};
use crate::shared::{ErrorType, NetworkError, NetworkResult};
use crate::socks5;

pub struct Relay {
    role: Role,
    listener: TcpListener,

    poller: Poller,
    events: Events,

    links: Vec<Link>,
    free: Vec<LinkId>,
    live: IndexSet<LinkId>,

    /// Resolved address candidates of the server proxy (local role only).
    peer_addrs: Vec<SocketAddr>,
    key: [u8; KEY_SIZE],

    connect_timeout: Duration,
    read_timeout: Duration,
    max_links: usize,
    reaped_at: Instant,

    log: logging::Logger,
}

impl Relay {
    const POLL_INTERVAL: Duration = Duration::from_secs(1);
    const EVENT_CAPACITY: usize = 1024;

    /// Constructs a relay in the given role. The local role requires a
    /// `peer` address in the config; the server role ignores it.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        role: Role,
        config: &RelayConfig,
        log: L,
    ) -> NetworkResult<Relay> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let listen = resolve_first(&config.listen)?;
        let listener = TcpListener::bind(&listen)?;

        let mut poller = Poller::new(1 + 2 * config.max_links)?;
        poller.ensure(&listener, LISTENER, Ready::readable())?;

        let peer_addrs = match role {
            Role::Local => {
                let peer = config
                    .peer
                    .as_ref()
                    .ok_or(NetworkError::Fatal(ErrorType::Resolve))?;
                resolve_all(peer)?
            }
            Role::Server => Vec::new(),
        };

        logging::info!(log, "relay listening"; "role" => ?role, "addr" => %listen);

        Ok(Relay {
            role,
            listener,
            poller,
            events: Events::with_capacity(Self::EVENT_CAPACITY),
            links: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            peer_addrs,
            key: *config.key,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            max_links: config.max_links,
            reaped_at: Instant::now(),
            log,
        })
    }

    /// The bound listen address.
    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The number of live links.
    #[inline]
    pub fn link_count(&self) -> usize {
        self.live.len()
    }

    /// Drives the relay until a poll failure.
    pub fn run(&mut self) -> NetworkResult<()> {
        loop {
            self.turn(Some(Self::POLL_INTERVAL))?;
        }
    }

    /// Executes one readiness batch: waits for events, dispatches them and
    /// runs the idle reaper. The reaper observes a consistent snapshot
    /// because it runs between batches, never concurrently with handlers.
    pub fn turn(&mut self, timeout: Option<Duration>) -> NetworkResult<()> {
        self.poller.wait(&mut self.events, timeout)?;

        let batch: Vec<(Token, Ready)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.readiness()))
            .collect();

        for (token, ready) in batch {
            if token == LISTENER {
                self.accept();
                continue;
            }

            let (id, side) = link::split_token(token);

            // Writability first: a completed connect unblocks the flushes
            // that the readable path extends. A link destroyed earlier in
            // the batch must not see the rest of its events.
            if ready.is_writable() {
                if !self.live.contains(&id) {
                    continue;
                }
                if let Err(NetworkError::Fatal(error)) = self.on_writable(id, side) {
                    self.teardown(id, error);
                }
            }

            if ready.is_readable() {
                if !self.live.contains(&id) {
                    continue;
                }
                if let Err(NetworkError::Fatal(error)) = self.on_readable(id, side) {
                    self.teardown(id, error);
                }
            }
        }

        self.reap(Instant::now());

        Ok(())
    }

    /// Drains the accept queue. Accept errors are logged and retried on the
    /// next readable event; a full connection table rejects the client.
    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let id = match self.allocate() {
                        Some(id) => id,
                        None => {
                            logging::warn!(self.log, "connection table full, rejecting";
                                           "peer" => %addr);
                            continue;
                        }
                    };

                    self.links[id].open(self.role, stream, Instant::now());

                    let registered = {
                        let stream = self.links[id]
                            .stream(Side::Local)
                            .expect("Fresh link must have a client stream");
                        self.poller
                            .ensure(stream, link::token(id, Side::Local), Ready::readable())
                    };

                    match registered {
                        Ok(()) => {
                            self.live.insert(id);
                            logging::debug!(self.log, "accepted connection";
                                            "link" => id, "peer" => %addr);
                        }
                        Err(error) => {
                            logging::warn!(self.log, "failed to register connection";
                                           "link" => id, "error" => ?error);
                            self.links[id].close();
                            self.free.push(id);
                        }
                    }
                }
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    logging::warn!(self.log, "accept failed"; "error" => %error);
                    break;
                }
            }
        }
    }

    fn allocate(&mut self) -> Option<LinkId> {
        if let Some(id) = self.free.pop() {
            return Some(id);
        }

        if self.links.len() < self.max_links {
            self.links.push(Link::new());
            return Some(self.links.len() - 1);
        }

        None
    }

    fn on_readable(&mut self, id: LinkId, side: Side) -> NetworkResult<()> {
        let role = self.links[id].role;
        let phase = self.links[id].phase;
        let plain = self.links[id].plain_side();

        if side == plain {
            match (role, phase) {
                (Role::Local, Phase::AwaitAuth) | (Role::Local, Phase::AwaitCommand) => {
                    self.read_socks5(id)
                }
                (Role::Local, Phase::Connecting) => self.read_early_payload(id),
                (_, Phase::Established) => self.pump_encrypt(id),
                _ => Ok(()),
            }
        } else {
            self.pump_decrypt(id)
        }
    }

    fn on_writable(&mut self, id: LinkId, side: Side) -> NetworkResult<()> {
        // a freed slot can be reused within one batch; ignore events that
        // belong to the socket of the previous tenant
        if self.links[id].stream(side).is_none() {
            return Ok(());
        }

        if side == Side::Server && !self.links[id].server_connected {
            return self.complete_connect(id);
        }

        self.flush(id, side)
    }

    /// Reads negotiation bytes from the client and advances the SOCKS5
    /// state machine as far as the buffered bytes allow.
    fn read_socks5(&mut self, id: LinkId) -> NetworkResult<()> {
        let limit = self.links[id].text.free_capacity();
        if limit == 0 {
            // no legitimate negotiation header fills the buffer
            return Err(NetworkError::Fatal(ErrorType::Protocol));
        }

        let count = {
            let Link {
                ref mut text,
                ref local,
                ..
            } = self.links[id];
            text.ingress(
                local.as_ref().expect("Local link must have a client stream"),
                limit,
            )?
        };

        if count > 0 {
            self.links[id].touch(Instant::now());
        }

        match self.links[id].phase {
            Phase::AwaitAuth => self.handle_auth_request(id),
            Phase::AwaitCommand => self.handle_cmd_request(id),
            _ => Ok(()),
        }
    }

    fn handle_auth_request(&mut self, id: LinkId) -> NetworkResult<()> {
        match socks5::parse_auth_request(self.links[id].text.read_slice()) {
            Ok(()) => {
                logging::debug!(self.log, "socks5 auth accepted"; "link" => id);
                {
                    let link = &mut self.links[id];
                    link.text.clear();
                    link.text.append(&socks5::auth_reply(true));
                    link.phase = Phase::AwaitCommand;
                }
                self.flush(id, Side::Local)
            }
            Err(NetworkError::Wait) => Ok(()),
            Err(error @ NetworkError::Fatal(ErrorType::Unsupported)) => {
                logging::info!(self.log, "socks5 auth methods rejected"; "link" => id);
                self.reject_client(id, &socks5::auth_reply(false));
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    fn handle_cmd_request(&mut self, id: LinkId) -> NetworkResult<()> {
        match socks5::parse_cmd_request(self.links[id].text.read_slice()) {
            Ok(request) => {
                logging::info!(self.log, "socks5 connect";
                               "link" => id, "destination" => ?request.destination);
                {
                    let link = &mut self.links[id];
                    link.ss_header_len = request.header_len;
                    // Strip VER | CMD | RSV; the remaining ATYP | ADDR | PORT
                    // is the shadowsocks header and stays queued as the first
                    // plaintext forwarded to the server.
                    link.text.consume(3);
                    link.phase = Phase::Connecting;
                }
                self.links[id].remote_addrs = self.peer_addrs.clone();
                self.connect_upstream(id)
            }
            Err(NetworkError::Wait) => Ok(()),
            Err(error @ NetworkError::Fatal(ErrorType::Unsupported)) => {
                // UDP ASSOCIATE: acknowledged and rejected, no upstream connect
                logging::info!(self.log, "rejecting udp associate"; "link" => id);
                let reply = socks5::cmd_reply(
                    socks5::REP_COMMAND_NOT_SUPPORTED,
                    &SocketAddr::from(([0, 0, 0, 0], 0)),
                );
                self.reject_client(id, &reply);
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Best-effort rejection reply ahead of a teardown.
    fn reject_client(&mut self, id: LinkId, reply: &[u8]) {
        let Link {
            ref mut text,
            ref local,
            ..
        } = self.links[id];

        text.clear();
        text.append(reply);
        text.egress(local.as_ref().expect("Local link must have a client stream"))
            .ok();
    }

    /// Client bytes arriving while the upstream connect is still in flight
    /// queue up behind the shadowsocks header.
    fn read_early_payload(&mut self, id: LinkId) -> NetworkResult<()> {
        let limit = self.links[id].text.free_capacity();
        if limit == 0 {
            self.remove_interest(id, Side::Local, Ready::readable())?;
            return Ok(());
        }

        let count = {
            let Link {
                ref mut text,
                ref local,
                ..
            } = self.links[id];
            text.ingress(
                local.as_ref().expect("Local link must have a client stream"),
                limit,
            )?
        };

        if count > 0 {
            self.links[id].touch(Instant::now());
        }

        Ok(())
    }

    /// Established-phase readable on the plaintext socket: stage bytes at
    /// the tail of `text`, encrypt them into the ciphertext queue and push
    /// toward the encrypted socket.
    fn pump_encrypt(&mut self, id: LinkId) -> NetworkResult<()> {
        let plain = self.links[id].plain_side();

        let limit = {
            let link = &self.links[id];
            let slack = if link.iv_sent { 0 } else { IV_SIZE };
            cmp::min(
                link.text.free_capacity(),
                link.cipher.free_capacity().saturating_sub(slack),
            )
        };

        if limit == 0 {
            // consumer stalled; pause the producer until the queue drains
            self.remove_interest(id, plain, Ready::readable())?;
            return Ok(());
        }

        let count = {
            let Link {
                ref mut text,
                ref local,
                ref server,
                ..
            } = self.links[id];
            let stream = match plain {
                Side::Local => local,
                Side::Server => server,
            }
            .as_ref()
            .expect("Established link must have both streams");
            text.ingress(stream, limit)?
        };

        if count > 0 {
            let key = self.key;
            let link = &mut self.links[id];
            link.touch(Instant::now());
            link.encrypt_tail(&key, count);
        }

        self.flush(id, plain.other())
    }

    /// Readable on the encrypted socket: stage ciphertext, absorb the IV,
    /// decrypt into `text` and either parse the shadowsocks header (server
    /// role) or push the plaintext onward.
    fn pump_decrypt(&mut self, id: LinkId) -> NetworkResult<()> {
        let enc = self.links[id].enc_side();
        if self.links[id].stream(enc).is_none() {
            return Ok(());
        }

        let (limit, start) = {
            let link = &self.links[id];
            let limit = cmp::min(
                link.cipher.free_capacity(),
                link.text.free_capacity() + link.iv_remaining(),
            );
            (limit, link.cipher.len())
        };

        if limit == 0 {
            self.remove_interest(id, enc, Ready::readable())?;
            return Ok(());
        }

        let count = {
            let Link {
                ref mut cipher,
                ref local,
                ref server,
                ..
            } = self.links[id];
            let stream = match enc {
                Side::Local => local,
                Side::Server => server,
            }
            .as_ref()
            .expect("Link must have a stream on its encrypted side");
            cipher.ingress(stream, limit)?
        };

        if count == 0 {
            return Ok(());
        }

        let key = self.key;
        {
            let link = &mut self.links[id];
            link.touch(Instant::now());
            link.decrypt_tail(&key, start, count);
        }

        if self.links[id].phase == Phase::AwaitHeader {
            self.parse_ss_header(id)?;
        }

        if self.links[id].phase == Phase::Established {
            self.flush(id, enc.other())?;
        }

        Ok(())
    }

    /// Server role: parse the decrypted shadowsocks header, resolve the
    /// origin and start connecting. A short header just waits for more
    /// ciphertext; it must never fail the link.
    fn parse_ss_header(&mut self, id: LinkId) -> NetworkResult<()> {
        match socks5::parse_address(self.links[id].text.read_slice()) {
            Ok((destination, header_len)) => {
                logging::info!(self.log, "shadowsocks header";
                               "link" => id, "destination" => ?destination);
                let addrs = destination.resolve()?;
                {
                    let link = &mut self.links[id];
                    link.ss_header_len = header_len;
                    link.text.consume(header_len);
                    link.remote_addrs = addrs;
                    link.phase = Phase::Connecting;
                }
                self.connect_upstream(id)
            }
            Err(NetworkError::Wait) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Starts the non-blocking connect to the first upstream candidate.
    fn connect_upstream(&mut self, id: LinkId) -> NetworkResult<()> {
        let addr = match self.links[id].remote_addrs.first() {
            Some(addr) => *addr,
            None => return Err(NetworkError::Fatal(ErrorType::Resolve)),
        };

        let stream = TcpStream::connect(&addr)?;
        logging::debug!(self.log, "upstream connect initiated"; "link" => id, "addr" => %addr);

        {
            let link = &mut self.links[id];
            link.server = Some(stream);
            link.touch(Instant::now());
        }

        // completion (or refusal) is reported through writability
        self.ensure_interest(id, Side::Server, Ready::writable())
    }

    /// First writable event on a connecting upstream socket. The socket is
    /// probed for a deferred connect error since writability alone can also
    /// signal a refused connection.
    fn complete_connect(&mut self, id: LinkId) -> NetworkResult<()> {
        let probe = self.links[id]
            .stream(Side::Server)
            .expect("Connecting link must have an upstream stream")
            .take_error()?;

        if let Some(error) = probe {
            logging::info!(self.log, "upstream connect failed"; "link" => id, "error" => %error);
            return Err(NetworkError::Fatal(ErrorType::Io(error.kind())));
        }

        {
            let link = &mut self.links[id];
            link.server_connected = true;
            link.touch(Instant::now());
        }

        // swap writability for readability on the upstream socket
        self.ensure_interest(id, Side::Server, Ready::readable())?;

        match self.links[id].role {
            Role::Local => self.finish_socks5(id),
            Role::Server => {
                logging::debug!(self.log, "origin connected"; "link" => id);
                self.links[id].phase = Phase::Established;
                // plaintext decrypted while the connect was in flight
                self.flush(id, Side::Server)
            }
        }
    }

    /// Local role, upstream connect completed: encrypt the queued
    /// shadowsocks header (and any early payload) behind a fresh IV, then
    /// emit the CONNECT reply with BND taken from the connected peer.
    fn finish_socks5(&mut self, id: LinkId) -> NetworkResult<()> {
        let bnd = self.links[id]
            .stream(Side::Server)
            .expect("Connected link must have an upstream stream")
            .peer_addr()?;
        let key = self.key;

        {
            let link = &mut self.links[id];
            let pending = link.text.len();
            link.encrypt_tail(&key, pending);
            link.text
                .append(&socks5::cmd_reply(socks5::REP_SUCCEEDED, &bnd));
            link.phase = Phase::Established;
        }

        logging::debug!(self.log, "link established";
                        "link" => id, "header_len" => self.links[id].ss_header_len);

        self.ensure_interest(id, Side::Local, Ready::readable())?;
        self.flush(id, Side::Server)?;
        self.flush(id, Side::Local)
    }

    /// Drains the queue consumed by `side` and maintains the backpressure
    /// discipline: a partial drain gains writability on the consumer and
    /// pauses the producer's readability; a full drain reverses both.
    fn flush(&mut self, id: LinkId, side: Side) -> NetworkResult<()> {
        if side == Side::Server && !self.links[id].server_connected {
            return Ok(());
        }
        if self.links[id].stream(side).is_none() {
            return Ok(());
        }

        let plain = self.links[id].plain_side();

        let (sent, drained) = {
            let Link {
                ref mut text,
                ref mut cipher,
                ref local,
                ref server,
                ..
            } = self.links[id];

            let queue = if side == plain { text } else { cipher };
            let stream = match side {
                Side::Local => local,
                Side::Server => server,
            }
            .as_ref()
            .expect("Link must have a stream for the side being flushed");

            let sent = queue.egress(stream)?;
            (sent, queue.is_empty())
        };

        if sent > 0 {
            self.links[id].touch(Instant::now());
        }

        let producer = self.producer_of(id, side);

        if drained {
            self.remove_interest(id, side, Ready::writable())?;
            self.add_interest(id, producer, Ready::readable())?;
            // the drained queue doubles as the staging area for this side's
            // own reads, which may have been paused on a full buffer
            if self.links[id].phase == Phase::Established {
                self.add_interest(id, side, Ready::readable())?;
            }
        } else {
            self.add_interest(id, side, Ready::writable())?;
            self.remove_interest(id, producer, Ready::readable())?;
        }

        Ok(())
    }

    /// The socket whose reads feed the queue consumed by `consumer`. Before
    /// establishment the local role's replies are produced by the client
    /// socket itself (request in, reply out).
    fn producer_of(&self, id: LinkId, consumer: Side) -> Side {
        if self.links[id].phase == Phase::Established {
            consumer.other()
        } else {
            consumer
        }
    }

    fn add_interest(&mut self, id: LinkId, side: Side, events: Ready) -> NetworkResult<()> {
        let token = link::token(id, side);
        if let Some(stream) = self.links[id].stream(side) {
            self.poller.add(stream, token, events)?;
        }
        Ok(())
    }

    fn remove_interest(&mut self, id: LinkId, side: Side, events: Ready) -> NetworkResult<()> {
        let token = link::token(id, side);
        if let Some(stream) = self.links[id].stream(side) {
            self.poller.remove(stream, token, events)?;
        }
        Ok(())
    }

    fn ensure_interest(&mut self, id: LinkId, side: Side, events: Ready) -> NetworkResult<()> {
        let token = link::token(id, side);
        if let Some(stream) = self.links[id].stream(side) {
            self.poller.ensure(stream, token, events)?;
        }
        Ok(())
    }

    fn teardown(&mut self, id: LinkId, error: ErrorType) {
        match error {
            ErrorType::PeerClosed => {
                logging::debug!(self.log, "peer closed"; "link" => id);
            }
            _ => {
                logging::info!(self.log, "link failed"; "link" => id, "error" => ?error);
            }
        }

        self.destroy(id);
    }

    /// Unlinks from the registry, removes both sockets from the poller and
    /// releases all per-connection state.
    fn destroy(&mut self, id: LinkId) {
        logging::debug!(self.log, "closing link";
                        "link" => id,
                        "phase" => ?self.links[id].phase,
                        "text_len" => self.links[id].text.len(),
                        "cipher_len" => self.links[id].cipher.len());

        if let Some(stream) = self.links[id].stream(Side::Local) {
            self.poller.forget(stream, link::token(id, Side::Local)).ok();
        }
        if let Some(stream) = self.links[id].stream(Side::Server) {
            self.poller.forget(stream, link::token(id, Side::Server)).ok();
        }

        self.links[id].close();
        self.live.remove(&id);
        self.free.push(id);
    }

    /// Destroys links that have been idle longer than the role-appropriate
    /// timeout. Runs at most once per read-timeout interval.
    fn reap(&mut self, now: Instant) {
        if now.duration_since(self.reaped_at) < self.read_timeout {
            return;
        }
        self.reaped_at = now;

        let expired: Vec<LinkId> = self
            .live
            .iter()
            .copied()
            .filter(|&id| {
                let link = &self.links[id];
                let limit = if link.server_connected {
                    self.read_timeout
                } else {
                    self.connect_timeout
                };
                now.duration_since(link.last_activity) > limit
            })
            .collect();

        for id in expired {
            logging::info!(self.log, "idle timeout, closing"; "link" => id);
            self.destroy(id);
        }
    }
}

fn resolve_all(addr: &str) -> NetworkResult<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|_| NetworkError::Fatal(ErrorType::Resolve))?
        .collect();

    if addrs.is_empty() {
        return Err(NetworkError::Fatal(ErrorType::Resolve));
    }

    Ok(addrs)
}

fn resolve_first(addr: &str) -> NetworkResult<SocketAddr> {
    Ok(resolve_all(addr)?[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone::config::PresharedKey;
    use rand::RngCore;
    use std::io::{Read, Write};
    use std::net;
    use std::thread;

    const TURN: Option<Duration> = Some(Duration::from_millis(5));

    fn config(listen: &str, peer: Option<String>) -> RelayConfig {
        RelayConfig {
            listen: listen.to_owned(),
            peer,
            key: PresharedKey::new([99; KEY_SIZE]),
            max_links: 16,
            connect_timeout_secs: 10,
            read_timeout_secs: 60,
        }
    }

    struct Harness {
        local: Relay,
        server: Relay,
    }

    impl Harness {
        fn new() -> Harness {
            let server = Relay::new(Role::Server, &config("127.0.0.1:0", None), None).unwrap();
            let peer = server.local_addr().unwrap().to_string();
            let local = Relay::new(Role::Local, &config("127.0.0.1:0", Some(peer)), None).unwrap();
            Harness { local, server }
        }

        fn drive(&mut self) {
            self.local.turn(TURN).unwrap();
            self.server.turn(TURN).unwrap();
        }

        fn connect_client(&self) -> net::TcpStream {
            let client = net::TcpStream::connect(self.local.local_addr().unwrap()).unwrap();
            client.set_nonblocking(true).unwrap();
            client
        }

        /// Drives the relays until `want` bytes arrive on `stream`.
        fn read_some(&mut self, stream: &mut net::TcpStream, want: usize) -> Vec<u8> {
            let mut out = Vec::new();
            for _ in 0..400 {
                self.drive();
                let mut buf = [0u8; 4096];
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(count) => {
                        out.extend_from_slice(&buf[..count]);
                        if out.len() >= want {
                            break;
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => (),
                    Err(err) => panic!("read failed: {}", err),
                }
            }
            out
        }

        /// Drives the relays until `stream` reports end-of-stream.
        fn read_eof(&mut self, stream: &mut net::TcpStream) -> bool {
            for _ in 0..400 {
                self.drive();
                let mut buf = [0u8; 4096];
                match stream.read(&mut buf) {
                    Ok(0) => return true,
                    Ok(_) => (),
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => (),
                    Err(_) => return true,
                }
            }
            false
        }
    }

    fn origin_listener() -> (net::TcpListener, SocketAddr) {
        let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn connect_request(addr: &SocketAddr) -> Vec<u8> {
        let mut req = vec![0x05, 0x01, 0x00];
        match addr {
            SocketAddr::V4(v4) => {
                req.push(0x01);
                req.extend_from_slice(&v4.ip().octets());
            }
            SocketAddr::V6(v6) => {
                req.push(0x04);
                req.extend_from_slice(&v6.ip().octets());
            }
        }
        req.extend_from_slice(&addr.port().to_be_bytes());
        req
    }

    fn accept_origin(harness: &mut Harness, listener: &net::TcpListener) -> net::TcpStream {
        for _ in 0..400 {
            harness.drive();
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true).unwrap();
                    return stream;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => (),
                Err(err) => panic!("origin accept failed: {}", err),
            }
        }
        panic!("origin connection never arrived");
    }

    fn socks5_handshake(harness: &mut Harness, client: &mut net::TcpStream, origin: &SocketAddr) {
        client.write_all(&[0x05, 0x01, 0x00]).unwrap();
        assert_eq!(harness.read_some(client, 2), vec![0x05, 0x00]);

        client.write_all(&connect_request(origin)).unwrap();
        let reply = harness.read_some(client, 10);
        assert!(reply.len() >= 4, "truncated connect reply: {:?}", reply);
        assert_eq!(&reply[..2], &[0x05, 0x00]);
    }

    #[test]
    fn test_happy_path_ipv4() {
        let (listener, origin_addr) = origin_listener();
        let mut harness = Harness::new();
        let mut client = harness.connect_client();

        socks5_handshake(&mut harness, &mut client, &origin_addr);
        let mut origin = accept_origin(&mut harness, &listener);

        // client -> origin
        let mut request = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut request);
        client.write_all(&request).unwrap();

        let mut received = Vec::new();
        for _ in 0..400 {
            harness.drive();
            let mut buf = [0u8; 4096];
            match origin.read(&mut buf) {
                Ok(0) => break,
                Ok(count) => {
                    received.extend_from_slice(&buf[..count]);
                    if received.len() >= request.len() {
                        break;
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => (),
                Err(err) => panic!("origin read failed: {}", err),
            }
        }
        assert_eq!(received, request);

        // origin -> client
        let response = b"HTTP/1.1 200 OK\r\n\r\nhello".to_vec();
        origin.write_all(&response).unwrap();
        assert_eq!(harness.read_some(&mut client, response.len()), response);

        assert_eq!(harness.local.link_count(), 1);
        assert_eq!(harness.server.link_count(), 1);
    }

    #[test]
    fn test_udp_associate_rejected() {
        let mut harness = Harness::new();
        let mut client = harness.connect_client();

        client.write_all(&[0x05, 0x01, 0x00]).unwrap();
        assert_eq!(harness.read_some(&mut client, 2), vec![0x05, 0x00]);

        client
            .write_all(&[0x05, 0x03, 0x00, 0x01, 127, 0, 0, 1, 0, 53])
            .unwrap();

        assert!(harness.read_eof(&mut client));
        assert_eq!(harness.local.link_count(), 0);
        // no relayed connection ever reached the server proxy
        assert_eq!(harness.server.link_count(), 0);
    }

    #[test]
    fn test_short_request_waits_for_more_bytes() {
        let mut harness = Harness::new();
        let mut client = harness.connect_client();

        client.write_all(&[0x05, 0x01]).unwrap();
        for _ in 0..25 {
            harness.drive();
        }

        let mut buf = [0u8; 16];
        match client.read(&mut buf) {
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => (),
            other => panic!("expected no reply yet, got {:?}", other),
        }
        assert_eq!(harness.local.link_count(), 1);

        client.write_all(&[0x00]).unwrap();
        assert_eq!(harness.read_some(&mut client, 2), vec![0x05, 0x00]);
    }

    #[test]
    fn test_unresolvable_domain_destroys_link() {
        let mut harness = Harness::new();
        let mut client = harness.connect_client();

        client.write_all(&[0x05, 0x01, 0x00]).unwrap();
        assert_eq!(harness.read_some(&mut client, 2), vec![0x05, 0x00]);

        let host = b"name.invalid";
        let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
        request.extend_from_slice(host);
        request.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&request).unwrap();

        assert!(harness.read_eof(&mut client));
        assert_eq!(harness.server.link_count(), 0);
    }

    #[test]
    fn test_idle_timeout_reaps_established_link() {
        let (listener, origin_addr) = origin_listener();

        let mut server_config = config("127.0.0.1:0", None);
        server_config.read_timeout_secs = 1;
        server_config.connect_timeout_secs = 1;
        let server = Relay::new(Role::Server, &server_config, None).unwrap();

        let peer = server.local_addr().unwrap().to_string();
        let mut local_config = config("127.0.0.1:0", Some(peer));
        local_config.read_timeout_secs = 1;
        local_config.connect_timeout_secs = 1;
        let local = Relay::new(Role::Local, &local_config, None).unwrap();

        let mut harness = Harness { local, server };
        let mut client = harness.connect_client();

        socks5_handshake(&mut harness, &mut client, &origin_addr);
        let _origin = accept_origin(&mut harness, &listener);
        assert_eq!(harness.local.link_count(), 1);

        thread::sleep(Duration::from_millis(1300));

        assert!(harness.read_eof(&mut client));
        assert_eq!(harness.local.link_count(), 0);
    }

    #[test]
    fn test_connection_table_capacity() {
        let server = Relay::new(Role::Server, &config("127.0.0.1:0", None), None).unwrap();
        let peer = server.local_addr().unwrap().to_string();

        let mut local_config = config("127.0.0.1:0", Some(peer));
        local_config.max_links = 1;
        let local = Relay::new(Role::Local, &local_config, None).unwrap();

        let mut harness = Harness { local, server };

        let mut first = harness.connect_client();
        first.write_all(&[0x05, 0x01, 0x00]).unwrap();
        assert_eq!(harness.read_some(&mut first, 2), vec![0x05, 0x00]);

        // the table is full; the second client is rejected outright
        let mut second = harness.connect_client();
        assert!(harness.read_eof(&mut second));
        assert_eq!(harness.local.link_count(), 1);
    }

    #[test]
    fn test_local_role_requires_peer() {
        let result = Relay::new(Role::Local, &config("127.0.0.1:0", None), None);

        assert!(result.is_err());
    }
}
