//! # jukebox-rs
//!
//! A playlist catalog served over TCP with Lamport-ordered replies.
//!
//! The crate provides the line protocol and song streaming codec, a
//! per-connection session state machine, a bounded connection acceptor, a
//! weighted round-robin selector with a placement proxy built on it, and a
//! client driver.

pub mod acceptor;
pub mod balancer;
pub mod catalog;
pub mod client;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod selector;
pub mod session;

pub use acceptor::{Acceptor, AcceptorOptions};
pub use catalog::{CatalogStore, FsCatalog, MemoryCatalog};
pub use client::Client;
pub use clock::LamportClock;
pub use error::{Error, Result};
pub use selector::{Endpoint, WeightedRoundRobin};
pub use session::{Session, SessionOptions};
