//! Push sockets.
//!
//! Clients connect to `/ws` and receive every new update as an `update`
//! frame. The server pings each socket every heartbeat interval and answers
//! client pings with `pong`. Frames are the engine's [`PushFrame`].

mod manager;

pub use cardsync_engine::PushFrame;
pub use manager::{Connection, ConnectionManager, FrameSender};
