//! REST collaborator contract.
//!
//! The push-data engine only needs one REST call, the bullet token bootstrap. It is
//! expressed through the [`Transport`] trait so that signed private calls can be
//! plugged in by the caller; [`HttpTransport`] covers unsigned public calls.

pub mod transport;

pub use transport::{Endpoints, HttpTransport, Transport};
