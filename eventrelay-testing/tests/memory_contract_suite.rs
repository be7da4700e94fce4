//! Runs the outbox store contract suite against the in-memory store.
//!
//! Every scenario added to `outbox_store_contract_tests!` is picked up here
//! without changes.

use eventrelay_testing::contract::outbox_store_contract_tests;

outbox_store_contract_tests! {
    suite = in_memory,
    make_store = eventrelay_memory::InMemoryOutboxStore::new,
}

mod shared_handle {
    use eventrelay_testing::contract::outbox_store_contract_tests;

    // `Arc<store>` is how dispatchers share a backend, so it must behave the same.
    outbox_store_contract_tests! {
        suite = arc_in_memory,
        make_store = || std::sync::Arc::new(eventrelay_memory::InMemoryOutboxStore::new()),
    }
}
