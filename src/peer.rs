//! Peer-facing types used by the scheduler.
//!
//! The scheduler never talks to a socket. It consumes what the connection
//! layer learned from a peer (the pieces it has, as a [`Bitfield`]) and
//! hands back [`BlockRequest`]s for the connection layer to send. Peers are
//! referred to by an opaque [`PeerKey`].

mod bitfield;
mod error;
mod peer_key;
mod piece;

pub use bitfield::Bitfield;
pub use error::PeerError;
pub use peer_key::PeerKey;
pub use piece::BlockRequest;
