use mio::event::Evented;
use mio::{Events, PollOpt, Ready, Token};
use std::io;
use std::time::Duration;

use crate::shared::{ErrorType, NetworkError, NetworkResult};

/// Token of the reserved row holding the listening socket. Link tokens
/// start at 1 and the row is never reused for a connection.
pub const LISTENER: Token = Token(0);

/// Fixed-capacity readiness multiplexer: a table of per-token interest sets
/// layered over a level-triggered [`mio::Poll`]. The relay engine expresses
/// backpressure purely as interest-set updates, so the table is the single
/// source of truth for which events a socket may deliver.
pub struct Poller {
    poll: mio::Poll,
    interest: Vec<Option<Ready>>,
}

impl Poller {
    pub fn new(rows: usize) -> io::Result<Poller> {
        Ok(Poller {
            poll: mio::Poll::new()?,
            interest: vec![None; rows],
        })
    }

    /// Sets the interest set of `token` to exactly `events`, registering the
    /// handle if it has no row yet. Fails with `Capacity` when the token is
    /// beyond the table; the caller must then reject the connection.
    pub fn ensure<E: Evented>(
        &mut self,
        handle: &E,
        token: Token,
        events: Ready,
    ) -> NetworkResult<()> {
        let row = self.row(token)?;

        match self.interest[row] {
            Some(current) => {
                if current != events {
                    self.poll.reregister(handle, token, events, PollOpt::level())?;
                    self.interest[row] = Some(events);
                }
            }
            None => {
                self.poll.register(handle, token, events, PollOpt::level())?;
                self.interest[row] = Some(events);
            }
        }

        Ok(())
    }

    /// Unions `events` into the interest set of `token`.
    pub fn add<E: Evented>(&mut self, handle: &E, token: Token, events: Ready) -> NetworkResult<()> {
        let row = self.row(token)?;

        match self.interest[row] {
            Some(mut current) => {
                current.insert(events);
                self.ensure(handle, token, current)
            }
            None => self.ensure(handle, token, events),
        }
    }

    /// Removes `events` from the interest set of `token`.
    pub fn remove<E: Evented>(
        &mut self,
        handle: &E,
        token: Token,
        events: Ready,
    ) -> NetworkResult<()> {
        let row = self.row(token)?;

        match self.interest[row] {
            Some(mut current) => {
                current.remove(events);
                self.ensure(handle, token, current)
            }
            None => self.ensure(handle, token, Ready::empty()),
        }
    }

    /// Releases the row of `token` and deregisters the handle.
    pub fn forget<E: Evented>(&mut self, handle: &E, token: Token) -> NetworkResult<()> {
        let row = self.row(token)?;

        if self.interest[row].take().is_some() {
            self.poll.deregister(handle)?;
        }

        Ok(())
    }

    /// The current interest set of `token`, if it has a row.
    #[inline]
    pub fn interest(&self, token: Token) -> Option<Ready> {
        self.interest.get(token.0).copied().flatten()
    }

    #[inline]
    pub fn wait(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        self.poll.poll(events, timeout)
    }

    #[inline]
    fn row(&self, token: Token) -> NetworkResult<usize> {
        if token.0 < self.interest.len() {
            Ok(token.0)
        } else {
            Err(NetworkError::Fatal(ErrorType::Capacity))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;

    fn listener() -> TcpListener {
        TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_ensure_add_remove() {
        let handle = listener();
        let mut poller = Poller::new(4).unwrap();
        let token = Token(1);

        poller.ensure(&handle, token, Ready::readable()).unwrap();
        assert_eq!(poller.interest(token), Some(Ready::readable()));

        poller.add(&handle, token, Ready::writable()).unwrap();
        assert_eq!(
            poller.interest(token),
            Some(Ready::readable() | Ready::writable())
        );

        poller.remove(&handle, token, Ready::readable()).unwrap();
        assert_eq!(poller.interest(token), Some(Ready::writable()));

        poller.forget(&handle, token).unwrap();
        assert_eq!(poller.interest(token), None);
    }

    #[test]
    fn test_capacity_exhausted() {
        let handle = listener();
        let mut poller = Poller::new(2).unwrap();

        let result = poller.ensure(&handle, Token(2), Ready::readable());

        assert_eq!(result, Err(NetworkError::Fatal(ErrorType::Capacity)));
    }

    #[test]
    fn test_add_on_absent_row_registers() {
        let handle = listener();
        let mut poller = Poller::new(4).unwrap();

        poller.add(&handle, Token(3), Ready::writable()).unwrap();

        assert_eq!(poller.interest(Token(3)), Some(Ready::writable()));
    }
}
