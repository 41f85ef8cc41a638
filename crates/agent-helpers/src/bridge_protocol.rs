//! Frame-type tags for the one-way input pipe between the service and the
//! session-0 helper. Shared so the service-side bridge and the helper binary
//! agree on the wire without duplicating magic numbers.
pub const CAPTURE_INPUT_TYPE_MOUSE: u8 = 1;
pub const CAPTURE_INPUT_TYPE_KEY: u8 = 2;
pub const CAPTURE_INPUT_TYPE_NOTIFY: u8 = 3;
