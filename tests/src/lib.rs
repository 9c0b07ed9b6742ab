//! # Courier Test Suite
//!
//! Cross-crate tests run against the in-memory broker.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── harness.rs          # Broker + client + workers fixture
//! └── integration/
//!     ├── rpc_flows.rs        # Round trips, remote errors, out-of-order replies
//!     ├── correlation.rs      # Exactly-once fulfillment, timeouts, leaks
//!     ├── node.rs             # Assembled node and health probe
//!     ├── worker_delivery.rs  # Ack-always, redelivery, prefetch, TTL, dedup
//!     └── connection_loss.rs  # Broker disconnect and recovery
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p courier-tests
//! cargo test -p courier-tests integration::correlation::
//!
//! # Benchmarks
//! cargo bench -p courier-tests
//! ```

pub mod harness;
