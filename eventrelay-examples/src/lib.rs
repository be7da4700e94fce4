//! Example applications built on `EventRelay`
//!
//! The [`orders`] module models a small order service that records its
//! events in the outbox, a broker stand-in backed by a channel, and a
//! consumer that decodes envelopes and drops redeliveries.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
// These are examples, so we don't need to be as pedantic
#![allow(clippy::missing_const_for_fn)]

/// Order service example: outbox writes, channel broker and idempotent consumer
pub mod orders;
