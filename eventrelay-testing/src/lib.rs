//! Test support for `EventRelay`
//!
//! - [`contract`]: the behavioural suite every `OutboxStore` backend must pass
//! - [`chaos`]: a store wrapper that injects failures and lost leases
//! - [`publisher`]: a scripted, recording `BrokerPublisher`

#![forbid(
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
    rust_2018_idioms,
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
    unused_qualifications,
    unused_results,
    unused_variables
)]

pub mod chaos;
pub mod contract;
pub mod publisher;

pub use chaos::*;
pub use publisher::*;
