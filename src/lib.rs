//! Message broker core.
//!
//! Clients publish messages to addresses; the [`postoffice`] routes them to
//! the queues bound there, the [`journal`] makes durable ones survive a
//! restart, and [`paging`] moves overflow out of memory. Consumers receive
//! over the [`remoting`] protocol, inside local or XA [`transaction`]s.
//! [`server::Broker`] wires it all together; [`client`] is the other end of
//! the wire.

pub mod buffer;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod filter;
pub mod journal;
pub mod message;
pub mod paging;
pub mod postoffice;
pub mod queue;
pub mod remoting;
pub mod server;
pub mod settings;
pub mod storage;
pub mod transaction;

pub use error::{Error, ErrorCode, Result};
pub use message::{Message, TypedValue};
pub use server::Broker;
