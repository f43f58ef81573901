//! GSP Server - Room directory, room protocol servers and relay
//!
//! # Flow
//!
//! 1. The account layer creates a room and joins its owner through
//!    [`RoomDirectory`]; every join mints a rendezvous token
//! 2. Members send their first UDP datagram to the main port, which
//!    confirms their endpoint
//! 3. Members ping each other directly; rosters come from the directory
//! 4. When direct traversal fails, a [`RelayService`] pairing is registered
//!    and the route is recorded in the room
//! 5. The owner sends Launch: every member learns the host endpoint and the
//!    room is removed

pub mod directory;
pub mod error;
pub mod handler;
pub mod recent;
pub mod relay;
pub mod room;

pub use directory::{DirectoryError, LoginInfo, RelayRegistrar, RoomDirectory, RoomList};
pub use error::ServerError;
pub use handler::{AuxHandler, RoomHandler, RoomService};
pub use relay::{RelayRouter, RelayService};
pub use room::{Identity, MemberInfo, Room, RoomDescription, RoomInfo, UserStatus};
