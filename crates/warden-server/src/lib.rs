//! Socket front end: authentication, connection routing, replayable
//! delivery, and the wiring from engine events to client frames.

pub mod auth;
pub mod buffer;
pub mod error;
pub mod event_bridge;
pub mod handlers;
pub mod protocol;
pub mod router;
pub mod server;

pub use auth::{JwtVerifier, StaticTokenVerifier, TokenVerifier};
pub use buffer::{BufferBackendKind, BufferConfig, DeliveryBuffer};
pub use error::{AuthError, ServerError};
pub use router::ConnectionRouter;
pub use server::{start, ServerConfig, ServerHandle, Services};
