pub mod assertions;
pub mod mocks;
pub mod setup;

// Re-export main utilities for use by test files
#[allow(unused_imports)]
pub use assertions::{assert_silent, eventually, recv_envelopes, DEFAULT_WAIT};
#[allow(unused_imports)]
pub use mocks::{client_pair, ClientEnd, HandlerOutcome, RecordingHandler};
#[allow(unused_imports)]
pub use setup::{BrokerSetup, BrokerSetupBuilder, HubSetup};
