//! Conversation core
//!
//! Provides:
//! - Messages and sessions with append-only history
//! - Routing of each message to the image path or the retrieval path
//! - The session registry and its storage backends
//! - Decoding of inbound image payloads

mod image;
mod message;
mod registry;
mod router;
mod session;
mod store;

pub use image::decode_image_payload;
pub use message::{Message, Role};
pub use registry::SessionRegistry;
pub use router::{format_image_context, MessageRouter, RouteRequest, RouteResult};
pub use session::{ChatFailure, ChatReply, Session};
pub use store::{InMemorySessionStore, RedisSessionStore, SessionStore};
