//! Runs the outbox store contract suite against PostgreSQL.
//!
//! Requires a docker daemon; the container is shared by every scenario and
//! each scenario migrates its own schema.

mod common;

mod postgres_contract_suite {
    use eventrelay_testing::contract::outbox_store_contract_tests;

    outbox_store_contract_tests! {
        suite = postgres_contract,
        make_store = || {
            crate::common::make_store()
        },
    }
}
