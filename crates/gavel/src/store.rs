// The storage seam: durable write intents, snapshot reads, and the async
// `AuctionStore` trait implemented by the SQLite database.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auction::{
    AuctionSnapshot, NewPlayer, NewTeam, Player, PlayerId, PlayerUpdate, Sport, Team, TeamId,
};
use crate::db::Database;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no active auction for player {0}")]
    NoActiveAuction(PlayerId),

    #[error("unknown player {0}")]
    UnknownPlayer(PlayerId),

    #[error("unknown team {0}")]
    UnknownTeam(TeamId),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("state serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One engine transition, as it must be recorded durably.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DurableWrite {
    Start {
        player_id: PlayerId,
        sport: Sport,
        opening_bid: u32,
    },
    Bid {
        player_id: PlayerId,
        team_id: TeamId,
        amount: u32,
    },
    UndoBid {
        player_id: PlayerId,
    },
    Sold {
        player_id: PlayerId,
        team_id: TeamId,
        amount: u32,
    },
    Unsold {
        player_id: PlayerId,
    },
    Cancel {
        player_id: PlayerId,
    },
    Reset {
        sport: Option<Sport>,
    },
}

impl fmt::Display for DurableWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurableWrite::Start {
                player_id,
                opening_bid,
                ..
            } => write!(f, "start(player {player_id}, opening {opening_bid})"),
            DurableWrite::Bid {
                player_id,
                team_id,
                amount,
            } => write!(f, "bid(player {player_id}, team {team_id}, {amount})"),
            DurableWrite::UndoBid { player_id } => write!(f, "undo_bid(player {player_id})"),
            DurableWrite::Sold {
                player_id,
                team_id,
                amount,
            } => write!(f, "sold(player {player_id}, team {team_id}, {amount})"),
            DurableWrite::Unsold { player_id } => write!(f, "unsold(player {player_id})"),
            DurableWrite::Cancel { player_id } => write!(f, "cancel(player {player_id})"),
            DurableWrite::Reset { sport: Some(s) } => write!(f, "reset({s})"),
            DurableWrite::Reset { sport: None } => write!(f, "reset(all)"),
        }
    }
}

/// Result of `read_snapshot`.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotRead {
    /// Nothing was written since the caller's stamp.
    Unchanged { stamp: u64 },
    /// The durable snapshot as of `stamp`.
    Changed {
        stamp: u64,
        snapshot: AuctionSnapshot,
    },
}

impl SnapshotRead {
    pub fn stamp(&self) -> u64 {
        match self {
            SnapshotRead::Unchanged { stamp } | SnapshotRead::Changed { stamp, .. } => *stamp,
        }
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, SnapshotRead::Changed { .. })
    }
}

/// Durable storage for auctions, bids, assignments and reference data.
///
/// Implementations must keep at most one active auction and must recompute
/// team budgets from recorded assignments rather than trusting deltas.
#[async_trait]
pub trait AuctionStore: Send + Sync {
    async fn record_start(
        &self,
        player_id: PlayerId,
        sport: Sport,
        opening_bid: u32,
    ) -> Result<i64, StoreError>;

    async fn record_bid(
        &self,
        player_id: PlayerId,
        team_id: TeamId,
        amount: u32,
    ) -> Result<(), StoreError>;

    async fn record_undo_bid(&self, player_id: PlayerId) -> Result<(), StoreError>;

    async fn record_sold(
        &self,
        player_id: PlayerId,
        team_id: TeamId,
        amount: u32,
    ) -> Result<(), StoreError>;

    /// Returns the team and amount credited back, if the player had a sale.
    async fn record_unsold(&self, player_id: PlayerId)
        -> Result<Option<(TeamId, u32)>, StoreError>;

    async fn record_cancel(&self, player_id: PlayerId) -> Result<(), StoreError>;

    async fn record_reset(&self, sport: Option<Sport>) -> Result<(), StoreError>;

    /// Read the durable snapshot. With `since`, returns `Unchanged` when no
    /// auction write happened after that stamp.
    async fn read_snapshot(&self, since: Option<u64>) -> Result<SnapshotRead, StoreError>;

    async fn load_players(&self) -> Result<Vec<Player>, StoreError>;

    async fn load_teams(&self) -> Result<Vec<Team>, StoreError>;

    async fn create_player(&self, player: &NewPlayer) -> Result<Player, StoreError>;

    async fn update_player(
        &self,
        player_id: PlayerId,
        update: &PlayerUpdate,
    ) -> Result<Player, StoreError>;

    async fn delete_player(&self, player_id: PlayerId) -> Result<(), StoreError>;

    async fn create_team(&self, team: &NewTeam) -> Result<Team, StoreError>;

    async fn delete_team(&self, team_id: TeamId) -> Result<(), StoreError>;

    /// Dispatch a recorded engine transition to the matching operation.
    async fn apply(&self, write: &DurableWrite) -> Result<(), StoreError> {
        match *write {
            DurableWrite::Start {
                player_id,
                sport,
                opening_bid,
            } => self.record_start(player_id, sport, opening_bid).await.map(|_| ()),
            DurableWrite::Bid {
                player_id,
                team_id,
                amount,
            } => self.record_bid(player_id, team_id, amount).await,
            DurableWrite::UndoBid { player_id } => self.record_undo_bid(player_id).await,
            DurableWrite::Sold {
                player_id,
                team_id,
                amount,
            } => self.record_sold(player_id, team_id, amount).await,
            DurableWrite::Unsold { player_id } => self.record_unsold(player_id).await.map(|_| ()),
            DurableWrite::Cancel { player_id } => self.record_cancel(player_id).await,
            DurableWrite::Reset { sport } => self.record_reset(sport).await,
        }
    }
}

#[async_trait]
impl AuctionStore for Database {
    async fn record_start(
        &self,
        player_id: PlayerId,
        sport: Sport,
        opening_bid: u32,
    ) -> Result<i64, StoreError> {
        Database::record_start(self, player_id, sport, opening_bid)
    }

    async fn record_bid(
        &self,
        player_id: PlayerId,
        team_id: TeamId,
        amount: u32,
    ) -> Result<(), StoreError> {
        Database::record_bid(self, player_id, team_id, amount)
    }

    async fn record_undo_bid(&self, player_id: PlayerId) -> Result<(), StoreError> {
        Database::record_undo_bid(self, player_id)
    }

    async fn record_sold(
        &self,
        player_id: PlayerId,
        team_id: TeamId,
        amount: u32,
    ) -> Result<(), StoreError> {
        Database::record_sold(self, player_id, team_id, amount)
    }

    async fn record_unsold(
        &self,
        player_id: PlayerId,
    ) -> Result<Option<(TeamId, u32)>, StoreError> {
        Database::record_unsold(self, player_id)
    }

    async fn record_cancel(&self, player_id: PlayerId) -> Result<(), StoreError> {
        Database::record_cancel(self, player_id)
    }

    async fn record_reset(&self, sport: Option<Sport>) -> Result<(), StoreError> {
        Database::record_reset(self, sport)
    }

    async fn read_snapshot(&self, since: Option<u64>) -> Result<SnapshotRead, StoreError> {
        Database::read_snapshot(self, since)
    }

    async fn load_players(&self) -> Result<Vec<Player>, StoreError> {
        Database::load_players(self)
    }

    async fn load_teams(&self) -> Result<Vec<Team>, StoreError> {
        Database::load_teams(self)
    }

    async fn create_player(&self, player: &NewPlayer) -> Result<Player, StoreError> {
        Database::create_player(self, player)
    }

    async fn update_player(
        &self,
        player_id: PlayerId,
        update: &PlayerUpdate,
    ) -> Result<Player, StoreError> {
        Database::update_player(self, player_id, update)
    }

    async fn delete_player(&self, player_id: PlayerId) -> Result<(), StoreError> {
        Database::delete_player(self, player_id)
    }

    async fn create_team(&self, team: &NewTeam) -> Result<Team, StoreError> {
        Database::create_team(self, team)
    }

    async fn delete_team(&self, team_id: TeamId) -> Result<(), StoreError> {
        Database::delete_team(self, team_id)
    }
}
