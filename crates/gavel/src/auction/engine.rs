// Auction engine: the authoritative state machine over players, teams, and
// the live auction snapshot.
//
// Every operation validates fully before mutating anything, so a rejected
// call leaves the engine exactly as it was.

use thiserror::Error;
use tracing::{debug, info, warn};

use super::player::{CategoryTable, Player, PlayerId, PlayerStatus, Sport};
use super::state::{AuctionSnapshot, Bid};
use super::team::{Team, TeamId};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuctionError {
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    #[error("team {team_id} has {remaining} points left and cannot cover {amount}")]
    InsufficientBudget {
        team_id: TeamId,
        amount: u32,
        remaining: u32,
    },

    #[error("bid of {amount} is below the minimum of {minimum}")]
    BidTooLow { amount: u32, minimum: u32 },

    #[error("the first bid must be exactly {required}, got {amount}")]
    OpeningBidMismatch { amount: u32, required: u32 },

    #[error("no auction is active")]
    NoActiveAuction,

    #[error("unknown player {0}")]
    UnknownPlayer(PlayerId),

    #[error("unknown team {0}")]
    UnknownTeam(TeamId),

    #[error("sale price {amount} does not match the current bid {current_bid}")]
    PriceMismatch { amount: u32, current_bid: u32 },

    #[error("team {team_id} plays {team_sport}, the player plays {player_sport}")]
    SportMismatch {
        team_id: TeamId,
        team_sport: Sport,
        player_sport: Sport,
    },
}

// ---------------------------------------------------------------------------
// Operation outcomes
// ---------------------------------------------------------------------------

/// A completed sale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sale {
    pub player_id: PlayerId,
    pub team_id: TeamId,
    pub amount: u32,
    /// Team and price of an earlier sale of the same player that was
    /// reversed first (re-auction path).
    pub reversed: Option<(TeamId, u32)>,
}

/// Outcome of marking the current player unsold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsold {
    pub player_id: PlayerId,
    /// Team and amount credited back when the player had been sold before.
    pub reversed: Option<(TeamId, u32)>,
}

/// What a reset touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetOutcome {
    pub players_reset: usize,
    pub teams_reset: usize,
    /// The running auction belonged to the reset scope and was ended.
    pub auction_terminated: bool,
}

/// Result of advancing the countdown by one second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownTick {
    /// No countdown running (or it already reached zero earlier).
    Idle,
    /// Seconds left after this tick.
    Running(u32),
    /// This tick brought the countdown to zero.
    Expired,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The auction state machine: Idle -> Active -> (Sold | Unsold | Cancelled) -> Idle.
#[derive(Debug, Clone)]
pub struct AuctionEngine {
    categories: CategoryTable,
    players: Vec<Player>,
    teams: Vec<Team>,
    snapshot: AuctionSnapshot,
}

impl AuctionEngine {
    /// Create an idle engine over the given reference data.
    pub fn new(categories: CategoryTable, players: Vec<Player>, teams: Vec<Team>) -> Self {
        AuctionEngine {
            categories,
            players,
            teams,
            snapshot: AuctionSnapshot::idle(),
        }
    }

    pub fn snapshot(&self) -> &AuctionSnapshot {
        &self.snapshot
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn teams(&self) -> &[Team] {
        &self.teams
    }

    pub fn categories(&self) -> &CategoryTable {
        &self.categories
    }

    pub fn is_active(&self) -> bool {
        self.snapshot.is_active
    }

    pub fn player(&self, player_id: PlayerId) -> Option<&Player> {
        self.players.iter().find(|p| p.id == player_id)
    }

    pub fn team(&self, team_id: TeamId) -> Option<&Team> {
        self.teams.iter().find(|t| t.id == team_id)
    }

    /// Teams competing in `sport`, in their stored order.
    pub fn teams_for_sport(&self, sport: Sport) -> impl Iterator<Item = &Team> {
        self.teams.iter().filter(move |t| t.sport == sport)
    }

    /// The smallest legal bid right now, or `None` when idle.
    ///
    /// Before any bid this is the opening bid (if the admin set one) or the
    /// category starting bid; afterwards it is the current bid plus the
    /// category increment.
    pub fn next_bid_amount(&self) -> Option<u32> {
        let player = self.active_player()?;
        if self.snapshot.bids.is_empty() {
            Some(self.opening_requirement(player))
        } else {
            Some(
                self.snapshot
                    .current_bid
                    .saturating_add(self.categories.increment(player.category)),
            )
        }
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Put a player up for auction.
    ///
    /// `starting_bid` sets an opening amount; `None` or `Some(0)` means the
    /// first bid must be the category starting bid. Callers are expected to
    /// have checked that enough teams exist for the player's sport.
    pub fn start_auction(
        &mut self,
        player_id: PlayerId,
        starting_bid: Option<u32>,
    ) -> Result<&AuctionSnapshot, AuctionError> {
        if self.snapshot.is_active {
            return Err(AuctionError::InvalidTransition(
                "an auction is already active",
            ));
        }
        let player = self
            .player(player_id)
            .ok_or(AuctionError::UnknownPlayer(player_id))?;

        let opening_bid = starting_bid.unwrap_or(0);
        let category_start = self.categories.starting_bid(player.category);
        if opening_bid != 0 && opening_bid < category_start {
            return Err(AuctionError::BidTooLow {
                amount: opening_bid,
                minimum: category_start,
            });
        }

        info!(
            "Auction started: {} ({}, {}) opening at {}",
            player.name, player.sport, player.category, opening_bid
        );
        self.snapshot = AuctionSnapshot {
            is_active: true,
            current_player: Some(player.clone()),
            opening_bid,
            current_bid: opening_bid,
            current_bidder_id: None,
            current_bidder_name: None,
            bids: Vec::new(),
            countdown: None,
        };
        Ok(&self.snapshot)
    }

    /// Record a bid from `team_id` for the current player.
    ///
    /// A team may raise its own leading bid.
    pub fn place_bid(
        &mut self,
        team_id: TeamId,
        team_name: &str,
        amount: u32,
    ) -> Result<Bid, AuctionError> {
        let player = self.active_player().ok_or(AuctionError::NoActiveAuction)?;
        let team = self.team(team_id).ok_or(AuctionError::UnknownTeam(team_id))?;
        if team.sport != player.sport {
            return Err(AuctionError::SportMismatch {
                team_id,
                team_sport: team.sport,
                player_sport: player.sport,
            });
        }

        if !team.can_afford(amount) {
            return Err(AuctionError::InsufficientBudget {
                team_id,
                amount,
                remaining: team.remaining_budget,
            });
        }

        if self.snapshot.bids.is_empty() {
            let required = self.opening_requirement(player);
            if amount < required {
                return Err(AuctionError::BidTooLow {
                    amount,
                    minimum: required,
                });
            }
            if amount != required {
                return Err(AuctionError::OpeningBidMismatch { amount, required });
            }
        } else {
            let minimum = self
                .snapshot
                .current_bid
                .saturating_add(self.categories.increment(player.category));
            if amount < minimum {
                return Err(AuctionError::BidTooLow { amount, minimum });
            }
        }

        let bid = Bid {
            seq: self.snapshot.bids.len() as u32 + 1,
            player_id: player.id,
            team_id,
            team_name: team_name.to_string(),
            amount,
            placed_at: chrono::Utc::now(),
        };
        debug!("Bid #{} by {} for {}", bid.seq, bid.team_name, bid.amount);

        self.snapshot.current_bid = amount;
        self.snapshot.current_bidder_id = Some(team_id);
        self.snapshot.current_bidder_name = Some(bid.team_name.clone());
        self.snapshot.bids.push(bid.clone());
        Ok(bid)
    }

    /// Remove the most recent bid. Returns the removed bid, or `None` when
    /// no bids have been placed.
    pub fn undo_last_bid(&mut self) -> Result<Option<Bid>, AuctionError> {
        if !self.snapshot.is_active {
            return Err(AuctionError::NoActiveAuction);
        }
        let Some(removed) = self.snapshot.bids.pop() else {
            return Ok(None);
        };

        match self.snapshot.bids.last() {
            Some(prev) => {
                self.snapshot.current_bid = prev.amount;
                self.snapshot.current_bidder_id = Some(prev.team_id);
                self.snapshot.current_bidder_name = Some(prev.team_name.clone());
            }
            None => {
                self.snapshot.current_bid = self.snapshot.opening_bid;
                self.snapshot.current_bidder_id = None;
                self.snapshot.current_bidder_name = None;
            }
        }
        info!("Undid bid #{} ({} by {})", removed.seq, removed.amount, removed.team_name);
        Ok(Some(removed))
    }

    /// Sell the current player to `team_id` at `amount`.
    ///
    /// `amount` must equal the current bid. The team usually is the current
    /// bidder, but the admin may assign the sale to another team in the same
    /// sport. Player status, team budget, team roster, and the return to
    /// Idle change together or not at all.
    pub fn sold(&mut self, team_id: TeamId, amount: u32) -> Result<Sale, AuctionError> {
        let player = self.active_player().ok_or(AuctionError::NoActiveAuction)?;
        let player_id = player.id;
        let team = self.team(team_id).ok_or(AuctionError::UnknownTeam(team_id))?;
        if team.sport != player.sport {
            return Err(AuctionError::SportMismatch {
                team_id,
                team_sport: team.sport,
                player_sport: player.sport,
            });
        }
        if self.snapshot.current_bid == 0 {
            return Err(AuctionError::InvalidTransition(
                "cannot sell before any bid",
            ));
        }
        if amount != self.snapshot.current_bid {
            return Err(AuctionError::PriceMismatch {
                amount,
                current_bid: self.snapshot.current_bid,
            });
        }

        // Re-selling to the team that already owns the player frees the old
        // price first, so count it as available.
        let refundable = team
            .players
            .iter()
            .find(|p| p.id == player_id)
            .and_then(|p| p.sold_price)
            .unwrap_or(0);
        if amount > team.remaining_budget.saturating_add(refundable) {
            return Err(AuctionError::InsufficientBudget {
                team_id,
                amount,
                remaining: team.remaining_budget,
            });
        }

        // All checks passed; mutate.
        let reversed = self.release_sale(player_id);
        if let Some((prev_team, credit)) = reversed {
            warn!(
                "Re-auction: reversed earlier sale of player {} to team {} ({} credited)",
                player_id, prev_team, credit
            );
        }

        let mut sold_player = self
            .players
            .iter()
            .find(|p| p.id == player_id)
            .cloned()
            .ok_or(AuctionError::UnknownPlayer(player_id))?;
        sold_player.status = PlayerStatus::Auctioned;
        sold_player.sold_to_team_id = Some(team_id);
        sold_player.sold_price = Some(amount);
        self.replace_player(sold_player.clone());

        if let Some(team) = self.teams.iter_mut().find(|t| t.id == team_id) {
            team.acquire(sold_player, amount);
            info!(
                "SOLD player {} to {} for {} ({} left)",
                player_id, team.name, amount, team.remaining_budget
            );
        }

        self.snapshot = AuctionSnapshot::idle();
        Ok(Sale {
            player_id,
            team_id,
            amount,
            reversed,
        })
    }

    /// Mark the current player unsold and return to Idle. If the player had
    /// been sold earlier (re-auction), that sale is reversed: the team is
    /// credited and the player leaves its roster.
    pub fn unsold(&mut self) -> Result<Unsold, AuctionError> {
        let player_id = self
            .active_player()
            .map(|p| p.id)
            .ok_or(AuctionError::NoActiveAuction)?;

        let reversed = self.release_sale(player_id);
        if let Some(player) = self.players.iter_mut().find(|p| p.id == player_id) {
            player.status = PlayerStatus::Unsold;
            player.sold_to_team_id = None;
            player.sold_price = None;
            info!("UNSOLD player {} ({})", player.id, player.name);
        }

        self.snapshot = AuctionSnapshot::idle();
        Ok(Unsold {
            player_id,
            reversed,
        })
    }

    /// Abandon the running auction without touching the player's status.
    pub fn cancel_auction(&mut self) -> Result<PlayerId, AuctionError> {
        let player_id = self
            .active_player()
            .map(|p| p.id)
            .ok_or(AuctionError::NoActiveAuction)?;
        info!("Auction for player {} cancelled", player_id);
        self.snapshot = AuctionSnapshot::idle();
        Ok(player_id)
    }

    /// Return players to the pool and teams to pristine budgets, for one
    /// sport or all. Always legal; a running auction in scope is ended.
    pub fn reset_auction(&mut self, sport: Option<Sport>) -> ResetOutcome {
        let in_scope = |s: Sport| sport.map_or(true, |filter| filter == s);
        let mut outcome = ResetOutcome::default();

        for player in self.players.iter_mut().filter(|p| in_scope(p.sport)) {
            player.make_available();
            outcome.players_reset += 1;
        }
        for team in self.teams.iter_mut().filter(|t| in_scope(t.sport)) {
            team.reset();
            outcome.teams_reset += 1;
        }

        let running_in_scope = self
            .snapshot
            .current_player
            .as_ref()
            .is_some_and(|p| in_scope(p.sport));
        if self.snapshot.is_active && running_in_scope {
            self.snapshot = AuctionSnapshot::idle();
            outcome.auction_terminated = true;
        }

        info!(
            "Reset ({}): {} players, {} teams, auction terminated: {}",
            sport.map(|s| s.as_str()).unwrap_or("all sports"),
            outcome.players_reset,
            outcome.teams_reset,
            outcome.auction_terminated
        );
        outcome
    }

    /// Set or clear the countdown. Setting requires an active auction.
    pub fn set_countdown(&mut self, value: Option<u32>) -> Result<(), AuctionError> {
        if value.is_some() && !self.snapshot.is_active {
            return Err(AuctionError::NoActiveAuction);
        }
        self.snapshot.countdown = value;
        Ok(())
    }

    /// Advance the countdown by one second. Reaching zero is only a signal;
    /// the engine never resolves the auction on its own.
    pub fn tick_countdown(&mut self) -> CountdownTick {
        match self.snapshot.countdown {
            None | Some(0) => CountdownTick::Idle,
            Some(1) => {
                self.snapshot.countdown = Some(0);
                CountdownTick::Expired
            }
            Some(n) => {
                self.snapshot.countdown = Some(n - 1);
                CountdownTick::Running(n - 1)
            }
        }
    }

    // ------------------------------------------------------------------
    // Reference data (admin) and reconciliation
    // ------------------------------------------------------------------

    /// Insert or replace a player by id.
    pub fn upsert_player(&mut self, player: Player) {
        if let Some(current) = self.snapshot.current_player.as_mut() {
            if current.id == player.id {
                *current = player.clone();
            }
        }
        self.replace_player(player);
    }

    /// Remove a player. The player under auction cannot be removed. A sold
    /// player's price is credited back to its team.
    pub fn remove_player(&mut self, player_id: PlayerId) -> Result<Player, AuctionError> {
        if self.snapshot.is_active && self.snapshot.current_player_id() == Some(player_id) {
            return Err(AuctionError::InvalidTransition(
                "cannot remove the player under auction",
            ));
        }
        let idx = self
            .players
            .iter()
            .position(|p| p.id == player_id)
            .ok_or(AuctionError::UnknownPlayer(player_id))?;
        self.release_sale(player_id);
        Ok(self.players.remove(idx))
    }

    /// Insert or replace a team by id.
    pub fn upsert_team(&mut self, team: Team) {
        match self.teams.iter_mut().find(|t| t.id == team.id) {
            Some(existing) => *existing = team,
            None => self.teams.push(team),
        }
    }

    /// Remove a team and return its players to the pool. The team holding
    /// the current bid cannot be removed.
    pub fn remove_team(&mut self, team_id: TeamId) -> Result<Team, AuctionError> {
        if self.snapshot.is_active && self.snapshot.current_bidder_id == Some(team_id) {
            return Err(AuctionError::InvalidTransition(
                "cannot remove the team holding the current bid",
            ));
        }
        let idx = self
            .teams
            .iter()
            .position(|t| t.id == team_id)
            .ok_or(AuctionError::UnknownTeam(team_id))?;
        let team = self.teams.remove(idx);
        for player in self
            .players
            .iter_mut()
            .filter(|p| p.sold_to_team_id == Some(team_id))
        {
            player.make_available();
        }
        Ok(team)
    }

    /// Overwrite the live snapshot with one pulled from durable storage.
    pub fn adopt_snapshot(&mut self, durable: AuctionSnapshot) {
        self.snapshot.adopt(durable);
    }

    /// Overwrite players and teams with freshly loaded durable copies.
    pub fn replace_reference_data(&mut self, players: Vec<Player>, teams: Vec<Team>) {
        self.players = players;
        self.teams = teams;
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn active_player(&self) -> Option<&Player> {
        if self.snapshot.is_active {
            self.snapshot.current_player.as_ref()
        } else {
            None
        }
    }

    fn opening_requirement(&self, player: &Player) -> u32 {
        if self.snapshot.opening_bid > 0 {
            self.snapshot.opening_bid
        } else {
            self.categories.starting_bid(player.category)
        }
    }

    fn replace_player(&mut self, player: Player) {
        match self.players.iter_mut().find(|p| p.id == player.id) {
            Some(existing) => *existing = player,
            None => self.players.push(player),
        }
    }

    /// Undo a standing sale of `player_id`: credit the owning team, drop the
    /// player from its roster, and return the player to the pool.
    fn release_sale(&mut self, player_id: PlayerId) -> Option<(TeamId, u32)> {
        let reversed = self.teams.iter_mut().find_map(|t| {
            let id = t.id;
            t.release(player_id).map(|credit| (id, credit))
        });
        if let Some(player) = self.players.iter_mut().find(|p| p.id == player_id) {
            if player.status == PlayerStatus::Auctioned {
                player.make_available();
            }
        }
        reversed
    }
}
