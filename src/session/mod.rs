pub mod manager;
pub mod router;
pub mod types;

pub use manager::SessionManager;
pub use router::{MessageRouter, RouteBinding, route_key};
pub use types::{Session, SessionConfig, SessionMetadata, SessionStatus};
