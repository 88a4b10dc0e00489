//! # Tunnel Test Suite
//!
//! End-to-end flows over real sockets: a broker bound to an ephemeral
//! port, workers dialing it with `tunnel-worker`, and public callers using
//! plain HTTP.
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── benches/          # Dispatch and pending-table benchmarks
//! └── src/integration/
//!     ├── harness.rs    # Broker, worker and local-service fixtures
//!     └── flows.rs      # Cross-crate scenarios
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p tunnel-tests
//! cargo bench -p tunnel-tests
//! ```

pub mod integration;
