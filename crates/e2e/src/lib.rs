//! ParkCheck contract test framework
//!
//! This crate provides a black-box contract harness for the parking-management
//! HTTP API that:
//! - Builds and spawns the API as a subprocess (or attaches to a running one)
//! - Registers and logs in the shared identities once per session
//! - Parses declarative YAML endpoint modules
//! - Checks status codes and response shapes, reporting failures with the body
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Contract Test Runner (Rust)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TestRunner                                                  │
//! │    ├── start_server() -> ServerHandle                       │
//! │    ├── IdentityProvider::session(slot) -> Session           │
//! │    ├── run_case(suite, case) -> TestResult                  │
//! │    └── Expect::verify(response) -> ContractViolation?       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Suite (YAML)                                               │
//! │    ├── name, tags, cleanup { path, keys }                   │
//! │    └── cases: [Case]                                        │
//! │          ├── known_issue?                                   │
//! │          └── steps: [Step]                                  │
//! │                ├── request { as, method, path, json|raw,    │
//! │                │             expect, save, setup }          │
//! │                └── log { message }                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod assertion;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod runner;
pub mod server;
pub mod spec;
pub mod vars;

pub use config::HarnessConfig;
pub use error::{E2eError, E2eResult};
pub use runner::{Outcome, TestRunner, TestSuiteResult};
pub use spec::{Filter, Suite, TestStep};
