//! WebTransport echo sessions over HTTP/3 on iroh.
//!
//! WebTransport is layered on top of HTTP/3 which is then layered on top of QUIC.
//! A client opens a session with an extended CONNECT request naming a URL path; the
//! server routes it by exact path match to a handler that installs whatever the session
//! should do, typically [`echo::serve`].
//!
//! Unlike a raw QUIC connection, one HTTP/3 connection may carry many sessions. Each
//! stream starts with a small header naming its session, and a per-connection driver
//! hands the stream to that session. Closing a session terminates its streams without
//! touching the connection or the other sessions on it.
//!
//! Plain HTTP/3 requests that reach a server are answered by a [`RequestGate`]: `GET`
//! gets a 200 and everything else a 405, unless configured otherwise.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use web_transport_echo::{echo, ClientBuilder, ServerBuilder};
//!
//! let server = ServerBuilder::new().build().await?;
//! server.route("/echo", echo::serve);
//! tokio::spawn({
//!     let server = server.clone();
//!     async move { server.run().await }
//! });
//!
//! let client = ClientBuilder::new().build().await?;
//! let conn = client.connect(server.endpoint_addr()).await?;
//! let url = format!("https://{}/echo", server.endpoint_id()).parse()?;
//! let session = conn.create_session(url).open().await?;
//!
//! let reply = echo::round_trip(&session, b"Hello, world!").await?;
//! assert_eq!(&reply[..], b"Hello, world!");
//! # Ok(())
//! # }
//! ```

mod client;
mod connect;
mod driver;
mod error;
mod event;
mod gate;
mod recv;
mod registry;
mod send;
mod server;
mod session;
mod settings;
mod shutdown;
mod state;
mod stream;
#[cfg(test)]
mod tests;

pub mod echo;

pub use client::*;
pub use connect::ConnectError;
pub use error::*;
pub use event::*;
pub use gate::*;
pub use recv::*;
pub use send::*;
pub use server::*;
pub use session::{Session, SessionId};
pub use settings::*;
pub use shutdown::*;
pub use state::{CloseReason, SessionState};
pub use stream::*;

/// The HTTP/3 ALPN is required when negotiating a QUIC connection.
pub const ALPN_H3: &str = "h3";

/// WT_SESSION_GONE: resets and stops the streams of a terminated session.
pub(crate) const SESSION_GONE: iroh::endpoint::VarInt = iroh::endpoint::VarInt::from_u32(0x170d_7b68);

/// Re-export the http crate because it's in the public API.
pub use http;
/// Re-export iroh.
pub use iroh;
