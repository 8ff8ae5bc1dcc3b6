//! The dispatch server: listener, authentication, per-client session and
//! result intake (spec section 4.4).

pub mod error;
pub mod server;
pub mod session;

pub use error::DispatchError;
pub use server::DispatchServer;
pub use session::ClientSession;
