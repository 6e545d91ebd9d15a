//! Per-peer request scheduling.
//!
//! [`PeerRequests`] keeps the two request queues of one peer: blocks picked
//! but not yet sent, and blocks sent and awaiting data. Its
//! [`fill_queue`](PeerRequests::fill_queue) asks the
//! [`PiecePicker`](crate::picker::PiecePicker) for enough blocks to keep the
//! peer busy for `request_queue_time`, falling back to a single duplicate
//! request in end-game.
//!
//! [`Download`] ties the picker and every peer's queues together for one
//! torrent and is what a session drives.
//!
//! # Example
//!
//! ```
//! use rbit_picker::peer::Bitfield;
//! use rbit_picker::picker::{PieceLayout, PiecePicker};
//! use rbit_picker::scheduler::Download;
//! use rbit_picker::settings::SchedulerSettings;
//!
//! let layout = PieceLayout::new(1024 * 1024, 256 * 1024).unwrap();
//! let mut download = Download::new(PiecePicker::new(layout), SchedulerSettings::default()).unwrap();
//!
//! let peer = download.add_peer();
//! download.peer_bitfield(peer, Bitfield::full(4)).unwrap();
//! download.peer_unchoked(peer).unwrap();
//! download.fill_queue(peer).unwrap();
//!
//! let requests = download.send_requests(peer).unwrap();
//! assert!(!requests.is_empty());
//! ```

mod download;
mod error;
mod fill;
mod peer_requests;

pub use download::{Download, ReceivedBlock};
pub use error::SchedulerError;
pub use fill::FillContext;
pub use peer_requests::{CancelOutcome, PeerRequests, PendingBlock, RequestFlags};
