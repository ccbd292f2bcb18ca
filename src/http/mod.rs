pub mod bridge;
pub mod csrf;
pub mod engine;
pub mod handler;

pub use bridge::{BridgeError, BridgeOptions, HttpGitBridge, HttpGitRepository};
pub use csrf::{CsrfExclusion, MaskedRequest, MaskedRequestStore, RequestView};
pub use engine::SmartHttpEngine;
pub use handler::create_router;
