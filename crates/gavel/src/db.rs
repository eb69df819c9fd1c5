// SQLite persistence layer for auctions, bids, assignments and reference data.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::auction::{
    AuctionSnapshot, Bid, Category, NewPlayer, NewTeam, Player, PlayerId, PlayerStatus,
    PlayerUpdate, Sport, Team, TeamId,
};
use crate::store::{SnapshotRead, StoreError};

type Result<T> = std::result::Result<T, StoreError>;

/// Key in `sync_state` holding the monotonically increasing change stamp.
const STAMP_KEY: &str = "change_stamp";

const PLAYER_SELECT: &str = "
    SELECT p.id, p.name, p.sport, p.category, p.photo_url, p.position, p.status,
           a.team_id, a.points_spent, p.created_at
      FROM players p
      LEFT JOIN player_assignments a ON a.player_id = p.id";

/// SQLite-backed durable store.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral in-memory database.
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS players (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                name       TEXT NOT NULL,
                sport      TEXT NOT NULL,
                category   TEXT NOT NULL,
                photo_url  TEXT NOT NULL DEFAULT '',
                position   TEXT,
                status     TEXT NOT NULL DEFAULT 'available'
                           CHECK (status IN ('available', 'auctioned', 'unsold')),
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                UNIQUE(name, sport)
            );

            CREATE TABLE IF NOT EXISTS teams (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                name       TEXT NOT NULL,
                sport      TEXT NOT NULL,
                max_points INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                UNIQUE(name, sport)
            );

            CREATE TABLE IF NOT EXISTS team_budgets (
                team_id          INTEGER PRIMARY KEY REFERENCES teams(id) ON DELETE CASCADE,
                max_points       INTEGER NOT NULL,
                spent_points     INTEGER NOT NULL DEFAULT 0,
                remaining_points INTEGER NOT NULL,
                updated_at       TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE IF NOT EXISTS auctions (
                id                     INTEGER PRIMARY KEY AUTOINCREMENT,
                sport                  TEXT NOT NULL,
                player_id              INTEGER NOT NULL REFERENCES players(id) ON DELETE CASCADE,
                opening_bid            INTEGER NOT NULL DEFAULT 0,
                current_bid            INTEGER NOT NULL DEFAULT 0,
                highest_bidder_team_id INTEGER REFERENCES teams(id) ON DELETE SET NULL,
                status                 TEXT NOT NULL
                                       CHECK (status IN ('active', 'closed', 'paused', 'cancelled')),
                started_at             TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                ended_at               TEXT,
                updated_at             TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_auctions_single_active
                ON auctions(status) WHERE status = 'active';

            CREATE TABLE IF NOT EXISTS bids (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                auction_id INTEGER NOT NULL REFERENCES auctions(id) ON DELETE CASCADE,
                team_id    INTEGER NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
                amount     INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE INDEX IF NOT EXISTS idx_bids_auction_id ON bids(auction_id);

            CREATE TABLE IF NOT EXISTS player_assignments (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                player_id    INTEGER NOT NULL UNIQUE REFERENCES players(id) ON DELETE CASCADE,
                team_id      INTEGER NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
                auction_id   INTEGER REFERENCES auctions(id) ON DELETE SET NULL,
                points_spent INTEGER NOT NULL,
                assigned_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE IF NOT EXISTS sync_state (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock).
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    // ------------------------------------------------------------------
    // Auction writes
    // ------------------------------------------------------------------

    /// Record a new active auction. Any auction row still marked active is
    /// closed first, inside the same transaction.
    pub fn record_start(&self, player_id: PlayerId, sport: Sport, opening_bid: u32) -> Result<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if !player_exists(&tx, player_id)? {
            return Err(StoreError::UnknownPlayer(player_id));
        }

        let closed = tx.execute(
            "UPDATE auctions
                SET status = 'closed',
                    ended_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                    updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE status = 'active'",
            [],
        )?;
        if closed > 0 {
            warn!("Closed {} stale active auction row(s) before starting a new one", closed);
        }

        let auction_id: i64 = tx.query_row(
            "INSERT INTO auctions (sport, player_id, opening_bid, current_bid, status)
             VALUES (?1, ?2, ?3, ?3, 'active')
             RETURNING id",
            params![sport.as_str(), player_id, opening_bid],
            |row| row.get(0),
        )?;
        let stamp = bump_stamp(&tx)?;
        tx.commit()?;
        debug!("Recorded auction {} for player {} (stamp {})", auction_id, player_id, stamp);
        Ok(auction_id)
    }

    /// Append a bid to the player's active auction and move its current bid.
    pub fn record_bid(&self, player_id: PlayerId, team_id: TeamId, amount: u32) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let (auction_id, _) = active_auction_for(&tx, player_id)?
            .ok_or(StoreError::NoActiveAuction(player_id))?;
        if !team_exists(&tx, team_id)? {
            return Err(StoreError::UnknownTeam(team_id));
        }

        tx.execute(
            "INSERT INTO bids (auction_id, team_id, amount) VALUES (?1, ?2, ?3)",
            params![auction_id, team_id, amount],
        )?;
        tx.execute(
            "UPDATE auctions
                SET current_bid = ?2,
                    highest_bidder_team_id = ?3,
                    updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id = ?1",
            params![auction_id, amount, team_id],
        )?;
        bump_stamp(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Drop the latest bid of the player's active auction and restore the
    /// previous bid (or the opening bid with no bidder).
    pub fn record_undo_bid(&self, player_id: PlayerId) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let (auction_id, opening_bid) = active_auction_for(&tx, player_id)?
            .ok_or(StoreError::NoActiveAuction(player_id))?;

        tx.execute(
            "DELETE FROM bids WHERE id = (SELECT MAX(id) FROM bids WHERE auction_id = ?1)",
            params![auction_id],
        )?;
        let previous: Option<(u32, TeamId)> = tx
            .query_row(
                "SELECT amount, team_id FROM bids WHERE auction_id = ?1 ORDER BY id DESC LIMIT 1",
                params![auction_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (current_bid, bidder) = match previous {
            Some((amount, team_id)) => (amount, Some(team_id)),
            None => (opening_bid, None),
        };
        tx.execute(
            "UPDATE auctions
                SET current_bid = ?2,
                    highest_bidder_team_id = ?3,
                    updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id = ?1",
            params![auction_id, current_bid, bidder],
        )?;
        bump_stamp(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Close the auction and assign the player to `team_id`, in one
    /// transaction. Budgets of the buying team (and of a previous owner on
    /// re-auction) are recomputed from the assignment sum.
    pub fn record_sold(&self, player_id: PlayerId, team_id: TeamId, amount: u32) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if !player_exists(&tx, player_id)? {
            return Err(StoreError::UnknownPlayer(player_id));
        }
        if !team_exists(&tx, team_id)? {
            return Err(StoreError::UnknownTeam(team_id));
        }

        let previous_team: Option<TeamId> = tx
            .query_row(
                "SELECT team_id FROM player_assignments WHERE player_id = ?1",
                params![player_id],
                |row| row.get(0),
            )
            .optional()?;
        let auction_id = active_auction_for(&tx, player_id)?.map(|(id, _)| id);

        tx.execute(
            "UPDATE auctions
                SET status = 'closed',
                    current_bid = ?2,
                    highest_bidder_team_id = ?3,
                    ended_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                    updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE status = 'active' AND player_id = ?1",
            params![player_id, amount, team_id],
        )?;
        // A resale replaces the row so the fresh id puts the player at the
        // end of the buyer's roster.
        tx.execute(
            "DELETE FROM player_assignments WHERE player_id = ?1",
            params![player_id],
        )?;
        tx.execute(
            "INSERT INTO player_assignments (player_id, team_id, auction_id, points_spent)
             VALUES (?1, ?2, ?3, ?4)",
            params![player_id, team_id, auction_id, amount],
        )?;
        set_player_status(&tx, player_id, PlayerStatus::Auctioned)?;

        recompute_budget(&tx, team_id)?;
        if let Some(prev) = previous_team.filter(|&prev| prev != team_id) {
            recompute_budget(&tx, prev)?;
        }
        bump_stamp(&tx)?;
        tx.commit()?;
        info!("Recorded sale of player {} to team {} for {}", player_id, team_id, amount);
        Ok(())
    }

    /// Mark the player unsold in one transaction: drop any assignment,
    /// recompute that team's budget, and cancel the player's active auction.
    pub fn record_unsold(&self, player_id: PlayerId) -> Result<Option<(TeamId, u32)>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if !player_exists(&tx, player_id)? {
            return Err(StoreError::UnknownPlayer(player_id));
        }

        let assignment: Option<(TeamId, u32)> = tx
            .query_row(
                "SELECT team_id, points_spent FROM player_assignments WHERE player_id = ?1",
                params![player_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((team_id, _)) = assignment {
            tx.execute(
                "DELETE FROM player_assignments WHERE player_id = ?1",
                params![player_id],
            )?;
            recompute_budget(&tx, team_id)?;
        }
        set_player_status(&tx, player_id, PlayerStatus::Unsold)?;
        tx.execute(
            "UPDATE auctions
                SET status = 'cancelled',
                    ended_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                    updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE status = 'active' AND player_id = ?1",
            params![player_id],
        )?;
        bump_stamp(&tx)?;
        tx.commit()?;

        if let Some((team_id, credit)) = assignment {
            info!("Reversed sale of player {}: {} credited to team {}", player_id, credit, team_id);
        }
        Ok(assignment)
    }

    /// Mark the player's active auction cancelled. Player status is untouched.
    pub fn record_cancel(&self, player_id: PlayerId) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let cancelled = tx.execute(
            "UPDATE auctions
                SET status = 'cancelled',
                    ended_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                    updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE status = 'active' AND player_id = ?1",
            params![player_id],
        )?;
        if cancelled == 0 {
            return Err(StoreError::NoActiveAuction(player_id));
        }
        bump_stamp(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Return players to the pool, drop assignments, restore budgets and
    /// cancel a running auction, for one sport or all.
    pub fn record_reset(&self, sport: Option<Sport>) -> Result<()> {
        let filter = sport.map(|s| s.as_str());
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM player_assignments
              WHERE player_id IN (SELECT id FROM players WHERE ?1 IS NULL OR sport = ?1)",
            params![filter],
        )?;
        let players = tx.execute(
            "UPDATE players
                SET status = 'available',
                    updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE ?1 IS NULL OR sport = ?1",
            params![filter],
        )?;
        tx.execute(
            "UPDATE team_budgets
                SET spent_points = 0,
                    remaining_points = max_points,
                    updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE team_id IN (SELECT id FROM teams WHERE ?1 IS NULL OR sport = ?1)",
            params![filter],
        )?;
        tx.execute(
            "UPDATE auctions
                SET status = 'cancelled',
                    ended_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                    updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE status = 'active' AND (?1 IS NULL OR sport = ?1)",
            params![filter],
        )?;
        bump_stamp(&tx)?;
        tx.commit()?;
        info!("Reset {} players ({})", players, filter.unwrap_or("all sports"));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Snapshot reads
    // ------------------------------------------------------------------

    /// The current change stamp (0 before any auction write).
    pub fn change_stamp(&self) -> Result<u64> {
        change_stamp(&self.conn())
    }

    /// Rebuild the live snapshot from the single active auction row.
    ///
    /// With `since`, returns `Unchanged` when no write happened after it.
    /// More than one active row is a consistency violation; the idle
    /// snapshot is returned instead of picking one.
    pub fn read_snapshot(&self, since: Option<u64>) -> Result<SnapshotRead> {
        let conn = self.conn();
        let stamp = change_stamp(&conn)?;
        if since.is_some_and(|since| stamp <= since) {
            return Ok(SnapshotRead::Unchanged { stamp });
        }

        let mut stmt = conn.prepare(
            "SELECT id, player_id, opening_bid, current_bid, highest_bidder_team_id
               FROM auctions WHERE status = 'active' ORDER BY id LIMIT 2",
        )?;
        let active = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, PlayerId>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, Option<TeamId>>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let snapshot = match active.as_slice() {
            [] => AuctionSnapshot::idle(),
            [(auction_id, player_id, opening_bid, current_bid, bidder)] => {
                match load_player(&conn, *player_id)? {
                    Some(player) => {
                        let bids = load_bids(&conn, *auction_id, *player_id)?;
                        let bidder_name = match bidder {
                            Some(team_id) => team_name(&conn, *team_id)?,
                            None => None,
                        };
                        AuctionSnapshot {
                            is_active: true,
                            current_player: Some(player),
                            opening_bid: *opening_bid,
                            current_bid: *current_bid,
                            current_bidder_id: *bidder,
                            current_bidder_name: bidder_name,
                            bids,
                            countdown: None,
                        }
                    }
                    None => AuctionSnapshot::idle(),
                }
            }
            _ => {
                warn!("Multiple active auction rows found; serving an empty snapshot");
                AuctionSnapshot::idle()
            }
        };
        Ok(SnapshotRead::Changed { stamp, snapshot })
    }

    // ------------------------------------------------------------------
    // Reference data
    // ------------------------------------------------------------------

    /// All players, ordered by id, with sale details from assignments.
    pub fn load_players(&self) -> Result<Vec<Player>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{PLAYER_SELECT} ORDER BY p.id"))?;
        let players = stmt
            .query_map([], player_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(players)
    }

    /// All teams, ordered by id. Rosters come from assignments in assignment
    /// order and remaining budgets are recomputed from their sum.
    pub fn load_teams(&self) -> Result<Vec<Team>> {
        let conn = self.conn();

        let mut rosters: HashMap<TeamId, Vec<Player>> = HashMap::new();
        let mut stmt = conn.prepare(&format!(
            "{PLAYER_SELECT} WHERE a.team_id IS NOT NULL ORDER BY a.id"
        ))?;
        let sold = stmt
            .query_map([], player_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for player in sold {
            if let Some(team_id) = player.sold_to_team_id {
                rosters.entry(team_id).or_default().push(player);
            }
        }

        let mut stmt = conn.prepare(
            "SELECT id, name, sport, max_points, created_at FROM teams ORDER BY id",
        )?;
        let teams = stmt
            .query_map([], |row| {
                let id: TeamId = row.get(0)?;
                let max_budget: u32 = row.get(3)?;
                Ok(Team {
                    id,
                    name: row.get(1)?,
                    sport: sport_column(row, 2)?,
                    max_budget,
                    remaining_budget: max_budget,
                    players: Vec::new(),
                    created_at: timestamp_column(row, 4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(teams
            .into_iter()
            .map(|mut team| {
                team.players = rosters.remove(&team.id).unwrap_or_default();
                team.remaining_budget = team.max_budget.saturating_sub(team.spent());
                team
            })
            .collect())
    }

    pub fn create_player(&self, player: &NewPlayer) -> Result<Player> {
        let conn = self.conn();
        let id: PlayerId = conn.query_row(
            "INSERT INTO players (name, sport, category, photo_url, position)
             VALUES (?1, ?2, ?3, ?4, ?5)
             RETURNING id",
            params![
                player.name,
                player.sport.as_str(),
                player.category.as_str(),
                player.photo_url,
                player.position,
            ],
            |row| row.get(0),
        )?;
        load_player(&conn, id)?.ok_or(StoreError::UnknownPlayer(id))
    }

    pub fn update_player(&self, player_id: PlayerId, update: &PlayerUpdate) -> Result<Player> {
        let conn = self.conn();
        let mut player = load_player(&conn, player_id)?.ok_or(StoreError::UnknownPlayer(player_id))?;
        update.apply_to(&mut player);
        conn.execute(
            "UPDATE players
                SET name = ?2, sport = ?3, category = ?4, photo_url = ?5, position = ?6,
                    updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id = ?1",
            params![
                player_id,
                player.name,
                player.sport.as_str(),
                player.category.as_str(),
                player.photo_url,
                player.position,
            ],
        )?;
        Ok(player)
    }

    /// Delete a player. A sold player's price is credited back to its team.
    pub fn delete_player(&self, player_id: PlayerId) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let owner: Option<TeamId> = tx
            .query_row(
                "SELECT team_id FROM player_assignments WHERE player_id = ?1",
                params![player_id],
                |row| row.get(0),
            )
            .optional()?;
        if tx.execute("DELETE FROM players WHERE id = ?1", params![player_id])? == 0 {
            return Err(StoreError::UnknownPlayer(player_id));
        }
        if let Some(team_id) = owner {
            recompute_budget(&tx, team_id)?;
        }
        bump_stamp(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Create a team together with its pristine budget row.
    pub fn create_team(&self, team: &NewTeam) -> Result<Team> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let (id, created_at): (TeamId, DateTime<Utc>) = tx.query_row(
            "INSERT INTO teams (name, sport, max_points) VALUES (?1, ?2, ?3)
             RETURNING id, created_at",
            params![team.name, team.sport.as_str(), team.max_budget],
            |row| Ok((row.get(0)?, timestamp_column(row, 1)?)),
        )?;
        tx.execute(
            "INSERT INTO team_budgets (team_id, max_points, spent_points, remaining_points)
             VALUES (?1, ?2, 0, ?2)",
            params![id, team.max_budget],
        )?;
        tx.commit()?;
        Ok(Team {
            id,
            name: team.name.clone(),
            sport: team.sport,
            max_budget: team.max_budget,
            remaining_budget: team.max_budget,
            players: Vec::new(),
            created_at,
        })
    }

    /// Delete a team. Its players return to the pool.
    pub fn delete_team(&self, team_id: TeamId) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE players
                SET status = 'available',
                    updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id IN (SELECT player_id FROM player_assignments WHERE team_id = ?1)",
            params![team_id],
        )?;
        if tx.execute("DELETE FROM teams WHERE id = ?1", params![team_id])? == 0 {
            return Err(StoreError::UnknownTeam(team_id));
        }
        bump_stamp(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Insert players in a single transaction, skipping any whose
    /// `(name, sport)` already exists. Returns how many were inserted.
    pub fn import_players(&self, players: &[NewPlayer]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        for player in players {
            inserted += tx.execute(
                "INSERT OR IGNORE INTO players (name, sport, category, photo_url, position)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    player.name,
                    player.sport.as_str(),
                    player.category.as_str(),
                    player.photo_url,
                    player.position,
                ],
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers (usable inside and outside transactions)
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
#[error("unrecognized {kind} value {value:?}")]
struct UnknownValue {
    kind: &'static str,
    value: String,
}

fn enum_column<T>(
    row: &Row<'_>,
    idx: usize,
    kind: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            Box::new(UnknownValue { kind, value: raw }),
        )
    })
}

fn sport_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Sport> {
    enum_column(row, idx, "sport", Sport::from_str_sport)
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Map a row selected with `PLAYER_SELECT`.
fn player_from_row(row: &Row<'_>) -> rusqlite::Result<Player> {
    Ok(Player {
        id: row.get(0)?,
        name: row.get(1)?,
        sport: sport_column(row, 2)?,
        category: enum_column(row, 3, "category", Category::from_str_category)?,
        photo_url: row.get(4)?,
        position: row.get(5)?,
        status: enum_column(row, 6, "status", PlayerStatus::from_str_status)?,
        sold_to_team_id: row.get(7)?,
        sold_price: row.get(8)?,
        created_at: timestamp_column(row, 9)?,
    })
}

fn load_player(conn: &Connection, player_id: PlayerId) -> Result<Option<Player>> {
    let player = conn
        .query_row(
            &format!("{PLAYER_SELECT} WHERE p.id = ?1"),
            params![player_id],
            player_from_row,
        )
        .optional()?;
    Ok(player)
}

fn load_bids(conn: &Connection, auction_id: i64, player_id: PlayerId) -> Result<Vec<Bid>> {
    let mut stmt = conn.prepare(
        "SELECT b.team_id, t.name, b.amount, b.created_at
           FROM bids b
           JOIN teams t ON t.id = b.team_id
          WHERE b.auction_id = ?1
          ORDER BY b.id",
    )?;
    let rows = stmt
        .query_map(params![auction_id], |row| {
            Ok((
                row.get::<_, TeamId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                timestamp_column(row, 3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows
        .into_iter()
        .enumerate()
        .map(|(i, (team_id, team_name, amount, placed_at))| Bid {
            seq: i as u32 + 1,
            player_id,
            team_id,
            team_name,
            amount,
            placed_at,
        })
        .collect())
}

fn team_name(conn: &Connection, team_id: TeamId) -> Result<Option<String>> {
    let name = conn
        .query_row(
            "SELECT name FROM teams WHERE id = ?1",
            params![team_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(name)
}

fn player_exists(conn: &Connection, player_id: PlayerId) -> Result<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM players WHERE id = ?1)",
        params![player_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn team_exists(conn: &Connection, team_id: TeamId) -> Result<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM teams WHERE id = ?1)",
        params![team_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// `(auction id, opening bid)` of the player's active auction.
fn active_auction_for(conn: &Connection, player_id: PlayerId) -> Result<Option<(i64, u32)>> {
    let row = conn
        .query_row(
            "SELECT id, opening_bid FROM auctions WHERE status = 'active' AND player_id = ?1",
            params![player_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row)
}

fn set_player_status(conn: &Connection, player_id: PlayerId, status: PlayerStatus) -> Result<()> {
    conn.execute(
        "UPDATE players
            SET status = ?2,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
          WHERE id = ?1",
        params![player_id, status.as_str()],
    )?;
    Ok(())
}

/// Recompute a team's spent/remaining points from its assignments, creating
/// the budget row if it is missing.
fn recompute_budget(conn: &Connection, team_id: TeamId) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO team_budgets (team_id, max_points, spent_points, remaining_points)
         SELECT id, max_points, 0, max_points FROM teams WHERE id = ?1",
        params![team_id],
    )?;
    conn.execute(
        "UPDATE team_budgets
            SET spent_points = (SELECT COALESCE(SUM(points_spent), 0)
                                  FROM player_assignments WHERE team_id = ?1),
                remaining_points = MAX(max_points - (SELECT COALESCE(SUM(points_spent), 0)
                                                      FROM player_assignments WHERE team_id = ?1), 0),
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
          WHERE team_id = ?1",
        params![team_id],
    )?;
    Ok(())
}

/// Load a JSON value from the `sync_state` table.
fn load_state(conn: &Connection, key: &str) -> Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(json_str) => Ok(Some(serde_json::from_str(&json_str)?)),
        None => Ok(None),
    }
}

fn change_stamp(conn: &Connection) -> Result<u64> {
    Ok(load_state(conn, STAMP_KEY)?
        .and_then(|v| v.as_u64())
        .unwrap_or(0))
}

/// Advance the change stamp. Must run in the same transaction as the write
/// it stamps.
fn bump_stamp(conn: &Connection) -> Result<u64> {
    let next = change_stamp(conn)? + 1;
    let json_str = serde_json::to_string(&next)?;
    conn.execute(
        "INSERT OR REPLACE INTO sync_state (key, value) VALUES (?1, ?2)",
        params![STAMP_KEY, json_str],
    )?;
    Ok(next)
}
