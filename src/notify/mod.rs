//! Change notification for live connections.
//!
//! Backends publish a [`ChangeEvent`](crate::types::ChangeEvent) for every
//! committed write. The [`Notifier`] drains those events and, for each
//! connection whose last result surfaces a changed row:
//! - re-resolves the connection's whole subscription set
//! - replaces its observed state
//! - pushes the new document on the connection's bounded channel
//!
//! Connections that cannot keep up with pushes are dropped.
//!
//! # Example
//!
//! ```ignore
//! let handle = notifier.connect(User::new(7));
//! let dispatcher = notifier.spawn()?;
//!
//! while let Ok(push) = handle.recv() {
//!     send_to_client(push.to_json());
//! }
//! dispatcher.shutdown();
//! ```

mod connection;
mod notifier;

pub use connection::{Connection, ConnectionHandle, ConnectionId, ConnectionState};
pub use notifier::{DispatchStats, Dispatcher, Notifier, NotifierConfig};
