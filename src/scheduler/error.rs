use thiserror::Error;

use crate::peer::{PeerError, PeerKey};
use crate::picker::PickerError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerKey),

    #[error("peer already registered: {0}")]
    DuplicatePeer(PeerKey),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("picker error: {0}")]
    Picker(#[from] PickerError),

    #[error("peer error: {0}")]
    Peer(#[from] PeerError),
}
