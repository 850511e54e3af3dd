//! # Warnet Test Suite
//!
//! Unified test crate for flows that cross crate boundaries.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── deployment_flows.rs   # Warnet over real backend adapters, scripted CLIs
//!     ├── scheduler_flows.rs    # topology file → channels at declared positions
//!     └── control_api.rs        # JSON-RPC requests end to end
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p warnet-tests
//! cargo test -p warnet-tests integration::control_api
//! ```

#![allow(unused_imports)]
#![allow(dead_code)]

pub mod integration;
