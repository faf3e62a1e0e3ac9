//! Carrier - transactional outbox and inbox messaging.
//!
//! Outgoing messages are stored in the same database transaction as the
//! business change that produced them and delivered by background workers;
//! incoming messages are stored before their subscriber runs. Both sides
//! retry failed attempts up to a ceiling and record every outcome, giving
//! at-least-once delivery and consumption.

pub mod bootstrap;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod message;
pub mod processor;
pub mod publisher;
pub mod serializer;
pub mod storage;
pub mod transport;
pub mod utils;

pub use bootstrap::{Carrier, CarrierBuilder, CarrierError};
