// Test tooling for the lark client: an in-process mock broker plus raw
// protocol parsing helpers.
mod broker;
pub mod ops;

pub use broker::{BrokerBuilder, MockBroker};
