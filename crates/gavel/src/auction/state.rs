// Auction snapshot: the single live auction, its bids, and snapshot diffing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::player::{Player, PlayerId};
use super::team::TeamId;

/// One bid within an auction. Bids are append-only for the auction's
/// lifetime (undo removes only the most recent one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    /// 1-based position of the bid within its auction.
    pub seq: u32,
    pub player_id: PlayerId,
    pub team_id: TeamId,
    pub team_name: String,
    pub amount: u32,
    pub placed_at: DateTime<Utc>,
}

/// The complete state of the (at most one) running auction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AuctionSnapshot {
    pub is_active: bool,
    pub current_player: Option<Player>,
    /// Opening amount set by the admin at start, 0 when none was set.
    #[serde(default)]
    pub opening_bid: u32,
    /// 0 until the first bid unless an opening bid was set.
    pub current_bid: u32,
    pub current_bidder_id: Option<TeamId>,
    pub current_bidder_name: Option<String>,
    pub bids: Vec<Bid>,
    /// Remaining seconds on the (cooperative) countdown, if one is running.
    pub countdown: Option<u32>,
}

impl AuctionSnapshot {
    /// The idle snapshot: no auction running.
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn current_player_id(&self) -> Option<PlayerId> {
        self.current_player.as_ref().map(|p| p.id)
    }

    /// The last bid placed, if any.
    pub fn last_bid(&self) -> Option<&Bid> {
        self.bids.last()
    }

    /// Overwrite this snapshot with a durable one. The countdown is a local
    /// timer and survives when the durable snapshot still shows the same
    /// player up for auction.
    pub fn adopt(&mut self, durable: AuctionSnapshot) {
        let keep_countdown = durable.is_active
            && durable.current_player_id().is_some()
            && durable.current_player_id() == self.current_player_id();
        let countdown = if keep_countdown { self.countdown } else { None };
        *self = durable;
        self.countdown = countdown;
    }
}

// --- Differential snapshot detection ---

/// The result of comparing a locally held snapshot with a pulled one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    /// An auction started or ended.
    pub activity_changed: bool,
    /// A different player is (or no player is) up for auction.
    pub player_changed: bool,
    /// The number of bids differs.
    pub bids_changed: bool,
    /// Same bid count but the current bid or bidder moved.
    pub bid_updated: bool,
}

impl SnapshotDiff {
    /// True when the two snapshots agree on everything observers render.
    pub fn is_empty(&self) -> bool {
        !(self.activity_changed || self.player_changed || self.bids_changed || self.bid_updated)
    }
}

/// Compare the fields observers care about. Timestamps and the local
/// countdown are deliberately not compared.
pub fn compute_snapshot_diff(local: &AuctionSnapshot, pulled: &AuctionSnapshot) -> SnapshotDiff {
    let bids_changed = local.bids.len() != pulled.bids.len();
    SnapshotDiff {
        activity_changed: local.is_active != pulled.is_active,
        player_changed: local.current_player_id() != pulled.current_player_id(),
        bids_changed,
        bid_updated: !bids_changed
            && (local.current_bid != pulled.current_bid
                || local.current_bidder_id != pulled.current_bidder_id),
    }
}
