//! Helpers shared by unit tests.

pub mod socket_guard;
pub mod stub_transport;
