//! Stream routing for the vicar gateway
//!
//! The router turns the routing key of a tunnel request into a destination:
//!
//! 1. A service name from an `in` mapping: the stream is spliced with a fresh
//!    TCP connection to the service's local port.
//! 2. Otherwise a decimal port: an `out` port hands the stream to its egress
//!    dispatcher, an `in` port resolves to the owning service.
//! 3. Anything else is an unknown route (404).
//!
//! Service names win when a key could match both ways.

pub mod route;
pub mod router;

pub use route::{Route, RouteError, ServiceTarget};
pub use router::Router;
