//! concat-test-utils: shared test harness for the receiver workspace.
//!
//! Provides a mock TCP accept/connect pair and a MessagePack batch-fixture
//! builder, so `concat-core`/`concat-protocol` tests and the binary's own
//! integration tests don't each hand-roll wire bytes or socket plumbing.

pub mod batch;
pub mod mock_tcp;

pub use mock_tcp::{connect_pair, MockTcpServer};
