//! Shared infrastructure for the `conduit` relay: streaming cipher contexts,
//! structured logging and configuration loading.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod config;
pub mod crypto;
pub mod logging;
