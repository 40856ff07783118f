//! Transports.

mod http;
pub use self::http::{ApiMode, HttpTransport, TransportError};
