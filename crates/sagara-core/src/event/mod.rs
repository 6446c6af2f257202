//! Event bus for flow lifecycle events.

pub mod bus;

pub use bus::EventBus;
