//! Collaborator implementations.
//!
//! Real transports live in the application; this crate only ships the
//! deterministic mocks used by its own tests and by downstream tests.

pub mod mock;
pub use mock::{MockFunctions, MockResponse, MockTransport};
