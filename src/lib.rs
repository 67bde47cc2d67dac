//! Signed message exchange with a market-operator endpoint, and an
//! unattended mirror of its message queue into local folders.
//!
//! Layers, bottom up: [`envelope`] (model and SOAP codec), [`signing`]
//! (interceptor and signature service), [`transport`], [`exchange`]
//! (send and validate), [`ops`] (Get, List, Put, Query) and [`sync`]
//! (engine, locks, watermarks, scheduler).

pub mod config;
pub mod envelope;
pub mod error;
pub mod exchange;
pub mod ops;
pub mod signing;
pub mod sync;
pub mod transport;

pub use error::{ExchangeError, Result};
