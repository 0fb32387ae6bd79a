//! Core of an encrypted SOCKS5 tunnel: a `local` proxy accepts SOCKS5 client
//! connections and relays them over an encrypted TCP channel to a `server`
//! proxy, which forwards the traffic to the requested origin. Both halves
//! are driven by the same single-threaded readiness loop in [`relay`].

pub mod buffer;
pub mod link;
pub mod poll;
pub mod relay;
pub mod shared;
pub mod socks5;
