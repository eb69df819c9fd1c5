// Players, sports, and the category table that prices them.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::team::TeamId;

/// Durable row id of a player.
pub type PlayerId = i64;

// ---------------------------------------------------------------------------
// Sport
// ---------------------------------------------------------------------------

/// Sports the league runs. Teams and players are partitioned by sport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sport {
    Basketball,
    Football,
}

impl Sport {
    pub const ALL: [Sport; 2] = [Sport::Basketball, Sport::Football];

    /// Parse a sport name, case-insensitively.
    pub fn from_str_sport(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "basketball" => Some(Sport::Basketball),
            "football" => Some(Sport::Football),
            _ => None,
        }
    }

    /// Storage/display key for this sport.
    pub fn as_str(&self) -> &'static str {
        match self {
            Sport::Basketball => "basketball",
            Sport::Football => "football",
        }
    }
}

impl fmt::Display for Sport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// Player classification. Fixes the starting bid and the minimum increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    National,
    State,
    District,
    School,
    Others,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::National,
        Category::State,
        Category::District,
        Category::School,
        Category::Others,
    ];

    /// Parse a stored category key (`"national"`, `"district"`, ...).
    pub fn from_str_category(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "national" => Some(Category::National),
            "state" => Some(Category::State),
            "district" => Some(Category::District),
            "school" => Some(Category::School),
            "others" => Some(Category::Others),
            _ => None,
        }
    }

    /// Map free-form achievement text (as found in sign-up sheets) to a
    /// category. Anything unrecognized lands in `Others`.
    pub fn from_achievement(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "national" => Category::National,
            "state" => Category::State,
            "district" => Category::District,
            "school" | "schools" => Category::School,
            _ => Category::Others,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::National => "national",
            Category::State => "state",
            Category::District => "district",
            Category::School => "school",
            Category::Others => "others",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bidding rules for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRules {
    /// The exact amount of the first bid when no opening bid was set.
    pub starting_bid: u32,
    /// Minimum raise over the current bid.
    pub increment: u32,
    pub label: String,
}

/// Immutable category -> rules mapping handed to the engine at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryTable {
    rules: HashMap<Category, CategoryRules>,
}

impl CategoryTable {
    /// Build a table from explicit rules. Categories missing from `rules`
    /// fall back to the built-in defaults.
    pub fn new(rules: HashMap<Category, CategoryRules>) -> Self {
        let mut table = Self::default();
        table.rules.extend(rules);
        table
    }

    pub fn rules(&self, category: Category) -> &CategoryRules {
        // Every category is populated by `Default`, and `new` only extends.
        &self.rules[&category]
    }

    pub fn starting_bid(&self, category: Category) -> u32 {
        self.rules(category).starting_bid
    }

    pub fn increment(&self, category: Category) -> u32 {
        self.rules(category).increment
    }
}

impl Default for CategoryTable {
    fn default() -> Self {
        let defaults = [
            (Category::National, 180, 25, "National"),
            (Category::State, 120, 15, "State"),
            (Category::District, 80, 10, "District"),
            (Category::School, 50, 5, "School"),
            (Category::Others, 10, 1, "Others"),
        ];
        let rules = defaults
            .into_iter()
            .map(|(category, starting_bid, increment, label)| {
                (
                    category,
                    CategoryRules {
                        starting_bid,
                        increment,
                        label: label.to_string(),
                    },
                )
            })
            .collect();
        CategoryTable { rules }
    }
}

// ---------------------------------------------------------------------------
// Player
// ---------------------------------------------------------------------------

/// Lifecycle of a player in the auction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerStatus {
    Available,
    Auctioned,
    Unsold,
}

impl PlayerStatus {
    pub fn from_str_status(s: &str) -> Option<Self> {
        match s {
            "available" => Some(PlayerStatus::Available),
            "auctioned" => Some(PlayerStatus::Auctioned),
            "unsold" => Some(PlayerStatus::Unsold),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerStatus::Available => "available",
            PlayerStatus::Auctioned => "auctioned",
            PlayerStatus::Unsold => "unsold",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub sport: Sport,
    pub category: Category,
    /// Opaque URL handed out by the image store. Empty when no photo.
    pub photo_url: String,
    #[serde(default)]
    pub position: Option<String>,
    pub status: PlayerStatus,
    /// Buying team, set only while `status == Auctioned`.
    #[serde(default)]
    pub sold_to_team_id: Option<TeamId>,
    /// Sale price, set only while `status == Auctioned`.
    #[serde(default)]
    pub sold_price: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl Player {
    /// Whether the player currently belongs to a team.
    pub fn is_sold(&self) -> bool {
        self.status == PlayerStatus::Auctioned && self.sold_to_team_id.is_some()
    }

    /// Return the player to the pool with no sale attached.
    pub fn make_available(&mut self) {
        self.status = PlayerStatus::Available;
        self.sold_to_team_id = None;
        self.sold_price = None;
    }
}

/// Admin input for creating a player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPlayer {
    pub name: String,
    pub sport: Sport,
    pub category: Category,
    #[serde(default)]
    pub photo_url: String,
    #[serde(default)]
    pub position: Option<String>,
}

/// Partial admin edit of a player. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerUpdate {
    pub name: Option<String>,
    pub sport: Option<Sport>,
    pub category: Option<Category>,
    pub photo_url: Option<String>,
    pub position: Option<String>,
}

impl PlayerUpdate {
    pub fn apply_to(&self, player: &mut Player) {
        if let Some(name) = &self.name {
            player.name = name.clone();
        }
        if let Some(sport) = self.sport {
            player.sport = sport;
        }
        if let Some(category) = self.category {
            player.category = category;
        }
        if let Some(photo_url) = &self.photo_url {
            player.photo_url = photo_url.clone();
        }
        if let Some(position) = &self.position {
            player.position = Some(position.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_matches_league_rules() {
        let table = CategoryTable::default();
        assert_eq!(table.starting_bid(Category::National), 180);
        assert_eq!(table.increment(Category::National), 25);
        assert_eq!(table.starting_bid(Category::District), 80);
        assert_eq!(table.increment(Category::District), 10);
        assert_eq!(table.starting_bid(Category::Others), 10);
        assert_eq!(table.increment(Category::Others), 1);
    }

    #[test]
    fn custom_table_keeps_defaults_for_missing_categories() {
        let mut rules = HashMap::new();
        rules.insert(
            Category::School,
            CategoryRules {
                starting_bid: 40,
                increment: 4,
                label: "Schools".into(),
            },
        );
        let table = CategoryTable::new(rules);
        assert_eq!(table.starting_bid(Category::School), 40);
        assert_eq!(table.rules(Category::School).label, "Schools");
        assert_eq!(table.starting_bid(Category::State), 120);
    }

    #[test]
    fn achievement_text_maps_to_category() {
        assert_eq!(Category::from_achievement("National"), Category::National);
        assert_eq!(Category::from_achievement(" schools "), Category::School);
        assert_eq!(Category::from_achievement("University"), Category::Others);
        assert_eq!(Category::from_achievement("nil"), Category::Others);
        assert_eq!(Category::from_achievement(""), Category::Others);
    }

    #[test]
    fn sport_parsing_is_case_insensitive() {
        assert_eq!(Sport::from_str_sport("Football"), Some(Sport::Football));
        assert_eq!(Sport::from_str_sport("BASKETBALL"), Some(Sport::Basketball));
        assert_eq!(Sport::from_str_sport("cricket"), None);
        for sport in Sport::ALL {
            assert_eq!(Sport::from_str_sport(&sport.to_string()), Some(sport));
        }
    }

    #[test]
    fn update_only_touches_given_fields() {
        let mut player = Player {
            id: 1,
            name: "Asha".into(),
            sport: Sport::Basketball,
            category: Category::State,
            photo_url: String::new(),
            position: None,
            status: PlayerStatus::Available,
            sold_to_team_id: None,
            sold_price: None,
            created_at: Utc::now(),
        };
        PlayerUpdate {
            category: Some(Category::National),
            position: Some("PG".into()),
            ..Default::default()
        }
        .apply_to(&mut player);

        assert_eq!(player.name, "Asha");
        assert_eq!(player.category, Category::National);
        assert_eq!(player.position.as_deref(), Some("PG"));
    }

    #[test]
    fn sold_needs_status_and_buyer() {
        let mut player = Player {
            id: 2,
            name: "Ravi".into(),
            sport: Sport::Football,
            category: Category::District,
            photo_url: String::new(),
            position: None,
            status: PlayerStatus::Auctioned,
            sold_to_team_id: Some(4),
            sold_price: Some(80),
            created_at: Utc::now(),
        };
        assert!(player.is_sold());

        player.make_available();
        assert!(!player.is_sold());
        assert_eq!(player.sold_price, None);
    }
}
