// Teams, their budgets, and their rosters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::player::{Player, PlayerId, PlayerStatus, Sport};

/// Durable row id of a team.
pub type TeamId = i64;

/// A team bidding in one sport.
///
/// Invariant: `remaining_budget == max_budget - sum(sold_price of players)`,
/// and never negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    pub sport: Sport,
    pub max_budget: u32,
    pub remaining_budget: u32,
    /// Acquired players in purchase order.
    pub players: Vec<Player>,
    pub created_at: DateTime<Utc>,
}

impl Team {
    /// Points spent on the current roster.
    pub fn spent(&self) -> u32 {
        self.players.iter().filter_map(|p| p.sold_price).sum()
    }

    /// Whether the budget invariant holds for this team.
    pub fn budget_is_consistent(&self) -> bool {
        self.spent() <= self.max_budget && self.remaining_budget == self.max_budget - self.spent()
    }

    pub fn can_afford(&self, amount: u32) -> bool {
        amount <= self.remaining_budget
    }

    /// Append a purchased player and debit the budget.
    ///
    /// Callers check affordability first; the debit saturates so the budget
    /// can never go negative.
    pub(crate) fn acquire(&mut self, mut player: Player, price: u32) {
        player.status = PlayerStatus::Auctioned;
        player.sold_to_team_id = Some(self.id);
        player.sold_price = Some(price);
        self.remaining_budget = self.remaining_budget.saturating_sub(price);
        self.players.push(player);
    }

    /// Remove a player from the roster and credit back what was paid.
    /// Returns the credited amount, or `None` if the player was not rostered.
    pub(crate) fn release(&mut self, player_id: PlayerId) -> Option<u32> {
        let idx = self.players.iter().position(|p| p.id == player_id)?;
        let player = self.players.remove(idx);
        let credit = player.sold_price.unwrap_or(0);
        self.remaining_budget = self.remaining_budget.saturating_add(credit).min(self.max_budget);
        Some(credit)
    }

    /// Empty the roster and restore the full budget.
    pub(crate) fn reset(&mut self) {
        self.players.clear();
        self.remaining_budget = self.max_budget;
    }
}

/// Admin input for creating a team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTeam {
    pub name: String,
    pub sport: Sport,
    pub max_budget: u32,
}
