//! Client engine for two-party conversations.
//!
//! [`ChatSession`] is the entry point. It is handed a [`LedgerClient`] for
//! durable operations and a [`DualChannel`] carrying the push socket and
//! the change-feed; [`HttpLedger`], [`WsPushChannel`] and
//! [`ChangeFeedChannel`] are the network implementations.

pub mod conversation;
pub mod dedup;
pub mod error;
pub mod http;
pub mod inbox;
pub mod session;
pub mod transport;
pub mod typing;
pub mod unread;
pub mod visibility;
pub mod ws;

pub use conversation::{ConversationView, LocalId, ViewEntry};
pub use error::{ClientError, SendError};
pub use http::HttpLedger;
pub use inbox::IndexEntry;
pub use session::{ChatSession, ClientEvent, SessionOptions};
pub use transport::{BusHub, DualChannel, LedgerClient, MessageBus, PushChannel};
pub use ws::{ChangeFeedChannel, ReconnectPolicy, WsPushChannel};
