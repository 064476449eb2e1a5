//! Request handlers for board operations.

mod mutations;
mod updates;
mod websocket;

pub use mutations::*;
pub use updates::*;
pub use websocket::*;
