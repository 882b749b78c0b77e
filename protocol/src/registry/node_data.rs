//! # Node Data
//!
//! One [`NodeData`] record describes one peer of the mesh as observed by
//! some node. Records travel over both delivery channels (full sync pages
//! and gossip) and are folded into the local registry with [`NodeData::merge`].
//!
//! ## Merge semantics
//!
//! The two channels race each other and neither orders against the other,
//! so merging has to give the same answer whatever order records arrive in
//! and however often they arrive. `merge` is therefore a join:
//!
//! - timestamps fold field-wise (`first_joined` takes the minimum, the
//!   other three take the maximum);
//! - the descriptive fields (activity, active/staked flags, addresses,
//!   version) come from whichever record has the greater precedence key,
//!   which orders by `last_updated` first and falls back to a total order
//!   over the remaining fields.

use chrono::{DateTime, Utc};
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};

use crate::config;

// ---------------------------------------------------------------------------
// Activity
// ---------------------------------------------------------------------------

/// What last happened to a peer.
///
/// Every consumer matches on this exhaustively. Activity kinds this build
/// does not know decode as [`Activity::Unknown`] and are handled as an
/// explicit no-op wherever a decision depends on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    /// The peer connected to the observing node.
    Joined,
    /// The peer disconnected from the observing node.
    Left,
    /// The peer's descriptive state changed while it stayed connected.
    Updated,
    /// An activity kind introduced by a newer protocol version.
    #[serde(other)]
    Unknown,
}

impl Activity {
    /// Tie-break rank used when two records carry the same `last_updated`.
    fn rank(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Joined => 1,
            Self::Updated => 2,
            Self::Left => 3,
        }
    }
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Joined => "joined",
            Self::Left => "left",
            Self::Updated => "updated",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// NodeData
// ---------------------------------------------------------------------------

/// Registry record for one peer identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeData {
    /// Identity of the peer this record describes. Registry key.
    pub peer_id: PeerId,
    /// Addresses the peer was observed at, best first.
    #[serde(default)]
    pub multiaddrs: Vec<Multiaddr>,
    /// Last activity observed for the peer.
    pub activity: Activity,
    /// Whether the peer is currently connected to the observer.
    pub is_active: bool,
    /// Whether the peer reports itself as staked.
    #[serde(default)]
    pub is_staked: bool,
    /// Protocol version the peer runs, when known.
    #[serde(default)]
    pub version: String,
    /// First time any observer saw the peer join.
    pub first_joined: DateTime<Utc>,
    /// Most recent join.
    pub last_joined: DateTime<Utc>,
    /// Most recent departure, if the peer ever left.
    #[serde(default)]
    pub last_left: Option<DateTime<Utc>>,
    /// Timestamp of the observation this record reflects.
    pub last_updated: DateTime<Utc>,
}

impl NodeData {
    /// Creates a record for a peer that joined at `now`.
    pub fn joined(peer_id: PeerId, multiaddrs: Vec<Multiaddr>, now: DateTime<Utc>) -> Self {
        Self {
            peer_id,
            multiaddrs,
            activity: Activity::Joined,
            is_active: true,
            is_staked: false,
            version: config::PROTOCOL_VERSION.to_string(),
            first_joined: now,
            last_joined: now,
            last_left: None,
            last_updated: now,
        }
    }

    /// Folds `other` into `self`. Returns `true` if `self` changed.
    ///
    /// Records for different peers are never merged; the call is a no-op
    /// returning `false`.
    pub fn merge(&mut self, other: &NodeData) -> bool {
        if self.peer_id != other.peer_id {
            return false;
        }

        let before = self.clone();

        if other.precedence_key() > self.precedence_key() {
            self.activity = other.activity;
            self.is_active = other.is_active;
            self.is_staked = other.is_staked;
            self.multiaddrs = other.multiaddrs.clone();
            self.version = other.version.clone();
        }

        self.first_joined = self.first_joined.min(other.first_joined);
        self.last_joined = self.last_joined.max(other.last_joined);
        self.last_left = self.last_left.max(other.last_left);
        self.last_updated = self.last_updated.max(other.last_updated);

        *self != before
    }

    /// Total order deciding which record's descriptive fields survive a merge.
    fn precedence_key(&self) -> (DateTime<Utc>, u8, bool, bool, Vec<Vec<u8>>, &str) {
        (
            self.last_updated,
            self.activity.rank(),
            self.is_active,
            self.is_staked,
            self.multiaddrs.iter().map(Multiaddr::to_vec).collect(),
            self.version.as_str(),
        )
    }
}
