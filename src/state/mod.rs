//! Network state: the entities of the mesh and the maps binding them.
//!
//! Everything here is owned exclusively by the event-loop task. Membership
//! and routing relations are represented by identifier (UID, SID, channel
//! key, client id) rather than by reference, so destroying an entity means
//! deleting exactly one authoritative entry.

pub mod channel;
pub mod client;
pub mod ids;
pub mod kline;
pub mod network;
pub mod server;
pub mod user;

pub use channel::{Channel, Topic};
pub use client::{Conn, LocalClient, LocalServer, LocalUser};
pub use ids::{ClientId, ClientIdAllocator, UidGenerator};
pub use kline::KLine;
pub use network::Network;
pub use server::Server;
pub use user::{User, UserModes};
