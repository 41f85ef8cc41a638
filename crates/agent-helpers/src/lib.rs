pub mod bridge_protocol;
pub mod input;
pub mod logging;
pub mod metrics;
pub mod screen;
pub mod shutdown;
