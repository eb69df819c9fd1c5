pub mod engine;
pub mod player;
pub mod state;
pub mod team;

pub use engine::{AuctionEngine, AuctionError, CountdownTick, ResetOutcome, Sale, Unsold};
pub use player::{
    Category, CategoryRules, CategoryTable, NewPlayer, Player, PlayerId, PlayerStatus,
    PlayerUpdate, Sport,
};
pub use state::{compute_snapshot_diff, AuctionSnapshot, Bid, SnapshotDiff};
pub use team::{NewTeam, Team, TeamId};
