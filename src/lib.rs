//! rbit-picker - BitTorrent piece picking and request scheduling
//!
//! This library decides which blocks of a torrent to request from which
//! peer, and tracks every block of every partially downloaded piece until
//! it is verified. It does no I/O of its own: the connection and disk
//! layers feed it events and send the requests it hands back.
//!
//! # Modules
//!
//! - [`picker`] - Piece availability, priorities and the block picker
//! - [`scheduler`] - Per-peer request queues, end-game and the torrent driver
//! - [`peer`] - Peer keys, bitfields and wire block requests
//! - [`settings`] - Scheduler tunables
//! - [`constants`] - Protocol and policy constants

pub mod constants;
pub mod peer;
pub mod picker;
pub mod scheduler;
pub mod settings;

pub use peer::{Bitfield, BlockRequest, PeerError, PeerKey};
pub use picker::{
    BlockState, DownloadInfo, PickOptions, PickRequest, PickerError, PieceBlock, PieceLayout,
    PiecePicker, PieceState,
};
pub use scheduler::{
    CancelOutcome, Download, PeerRequests, ReceivedBlock, RequestFlags, SchedulerError,
};
pub use settings::SchedulerSettings;
