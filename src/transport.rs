//! Transport abstraction for the rendezvous server connection.
//!
//! The [`Transport`] trait is a bidirectional, ordered text-message channel.
//! The rendezvous protocol is JSON, so implementations only shuttle complete
//! frames and handle framing internally.
//!
//! Connection setup lives behind the [`Connector`] trait instead: the
//! Transport Channel calls [`Connector::connect`] as soon as it is constructed
//! and again on every explicit restart, so callers hand over "how to connect"
//! rather than an already connected stream.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use pairchat_client::error::PairChatError;
//! use pairchat_client::transport::Transport;
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), PairChatError> {
//!         // Write one JSON frame
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, PairChatError>> {
//!         // Read one JSON frame; `None` once the server closed cleanly
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), PairChatError> {
//!         todo!()
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::PairChatError;

/// A bidirectional text message transport to the rendezvous server.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe: the channel loop polls it
/// inside `tokio::select!`, and a cancelled call must not lose a frame.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::TransportSend`] or
    /// [`PairChatError::TransportClosed`] if the frame could not be written.
    async fn send(&mut self, message: String) -> Result<(), PairChatError>;

    /// Receive the next JSON text frame.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete frame
    /// - `Some(Err(e))`: the connection failed
    /// - `None`: the server closed the connection cleanly
    async fn recv(&mut self) -> Option<Result<String, PairChatError>>;

    /// Close the connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails. Resources are released
    /// either way.
    async fn close(&mut self) -> Result<(), PairChatError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn send(&mut self, message: String) -> Result<(), PairChatError> {
        (**self).send(message).await
    }

    async fn recv(&mut self) -> Option<Result<String, PairChatError>> {
        (**self).recv().await
    }

    async fn close(&mut self) -> Result<(), PairChatError> {
        (**self).close().await
    }
}

/// Opens connections to the rendezvous server.
///
/// Called once when a Transport Channel is constructed and once per explicit
/// restart after a transport failure. Never called in a retry loop.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a new connection.
    ///
    /// # Errors
    ///
    /// Any error is reported to the session as `connectError(reason)`.
    async fn connect(&self) -> Result<Box<dyn Transport>, PairChatError>;
}
