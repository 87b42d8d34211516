//! Connection handling: configuration, transport, framing, the type-state
//! client and the runtime [`Session`] wrapper.

mod client;
mod config;
mod framed;
mod session;
mod stream;

pub use client::{Authenticated, Client, NotAuthenticated, Selected};
pub use config::{Config, ConfigBuilder, Security, SessionConfig};
pub use framed::FramedStream;
pub use session::{FetchedSummary, Session, SessionState};
pub use stream::{ImapStream, connect, create_tls_connector};
