#![forbid(
    dead_code,
    invalid_value,
    overflowing_literals,
    unconditional_recursion,
    unreachable_pub,
    unused_allocation,
    unsafe_code
)]
#![deny(
    bad_style,
    clippy::allow_attributes,
    deprecated,
    meta_variable_misuse,
    non_ascii_idents,
    non_camel_case_types,
    non_snake_case,
    non_upper_case_globals,
    rust_2018_idioms,
    rust_2021_compatibility,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_code,
    unused_assignments,
    unused_attributes,
    unused_extern_crates,
    unused_imports,
    unused_must_use,
    unused_mut,
    unused_parens,
    unused_results,
    unused_variables
)]

//! Shared vocabulary types and traits for the EventRelay transactional outbox.
//!
//! This crate provides the foundational types that are shared between the main
//! `eventrelay` crate and storage adapters like `eventrelay-postgres`. Keeping
//! them in a separate crate lets adapters depend on the vocabulary without
//! depending on the dispatcher.
//!
//! # Overview
//!
//! This crate contains:
//! - Core traits: `OutboxStore`, `TransactionalStore`, `DomainEvent`
//! - Domain types: `EventId`, `PartitionKey`, `EventType`, `SchemaVersion`,
//!   `LeaseOwner`, `Topic`, `Timestamp`, `Headers`
//! - Rows and states: `OutboxEvent`, `EventStatus`, `DeadLetterCause`, `StatusCounts`
//! - Errors and outcomes: `OutboxStoreError`, `Operation`, `Transition`

mod event;
mod store;
mod types;

pub use event::{
    DeadLetterCause, DomainEvent, EventStatus, Headers, OutboxEvent, StatusCounts, UnknownStatus,
};
pub use store::{Operation, OutboxStore, OutboxStoreError, TransactionalStore, Transition};
pub use types::{
    EventId, EventIdError, EventType, EventTypeError, LeaseOwner, LeaseOwnerError, PartitionKey,
    PartitionKeyError, SchemaVersion, SchemaVersionError, Timestamp, Topic, TopicError,
};
