use std::fmt;

/// An opaque handle identifying a connected peer inside the scheduler.
///
/// Blocks remember which peer requested them through a `PeerKey`. The key
/// holds no reference to the connection itself, so the connection layer
/// must call [`PiecePicker::clear_peer`] (or remove the peer from its
/// [`Download`]) before the connection goes away.
///
/// Keys handed out by a [`Download`] are never reused, so a stale key can
/// never be confused with a newer connection.
///
/// [`PiecePicker::clear_peer`]: crate::picker::PiecePicker::clear_peer
/// [`Download`]: crate::scheduler::Download
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey(pub u32);

impl PeerKey {
    /// Returns the raw numeric value of the key.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for PeerKey {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerKey({})", self.0)
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}
