// Configuration loading and validation (config/auction.toml).

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::auction::{Category, CategoryRules, CategoryTable, Sport};

const CONFIG_FILE: &str = "auction.toml";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub league: LeagueConfig,
    pub categories: CategoryTable,
    pub sync: SyncConfig,
    pub db_path: String,
    pub mirror_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct LeagueConfig {
    pub name: String,
    pub sports: HashMap<Sport, SportRules>,
}

impl LeagueConfig {
    pub fn rules(&self, sport: Sport) -> Option<&SportRules> {
        self.sports.get(&sport)
    }
}

/// Per-sport roster expectations, used by presentation layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SportRules {
    pub min_players: usize,
    pub default_teams: usize,
}

impl SportRules {
    /// Players a team still has to buy to field a side.
    pub fn players_needed(&self, roster_len: usize) -> usize {
        self.min_players.saturating_sub(roster_len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Apply locally and report success; the durable write follows.
    Optimistic,
    /// Report success only after the durable write is confirmed.
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteFailurePolicy {
    /// Keep the optimistic state. A failed write leaves the change stamp
    /// unchanged, so the divergence lasts until another write lands or a
    /// refresh is requested.
    Keep,
    /// Force a full pull from durable storage right away.
    Resync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountdownExpiry {
    /// Emit an event and leave resolution to the caller.
    Signal,
    /// Sell to the leading bidder at the current bid, else mark unsold.
    AutoResolve,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub poll_interval_ms: u64,
    pub roster_refresh_every: u32,
    pub countdown_tick_ms: u64,
    pub write_mode: WriteMode,
    pub on_write_failure: WriteFailurePolicy,
    pub countdown_expiry: CountdownExpiry,
    pub min_teams_to_start: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            poll_interval_ms: 500,
            roster_refresh_every: 10,
            countdown_tick_ms: 1000,
            write_mode: WriteMode::Optimistic,
            on_write_failure: WriteFailurePolicy::Keep,
            countdown_expiry: CountdownExpiry::Signal,
            min_teams_to_start: 2,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms)
    }
}

// ---------------------------------------------------------------------------
// auction.toml file layout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct AuctionFile {
    league: LeagueSection,
    #[serde(default)]
    categories: HashMap<String, CategoryRules>,
    #[serde(default)]
    sync: SyncConfig,
    database: DatabaseSection,
    #[serde(default)]
    mirror: MirrorSection,
}

#[derive(Debug, Clone, Deserialize)]
struct LeagueSection {
    name: String,
    #[serde(default)]
    sports: HashMap<String, SportRules>,
}

#[derive(Debug, Clone, Deserialize)]
struct DatabaseSection {
    path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MirrorSection {
    path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load and validate `config/auction.toml` relative to `base_dir`.
///
/// Does not copy defaults; `load_config()` does that first.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = base_dir.join("config").join(CONFIG_FILE);
    let text = read_file(&path)?;
    let file: AuctionFile = toml::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: path.clone(),
        source: e,
    })?;

    let mut sports = HashMap::new();
    for (key, rules) in file.league.sports {
        let sport = Sport::from_str_sport(&key).ok_or_else(|| ConfigError::ValidationError {
            field: format!("league.sports.{key}"),
            message: "unknown sport".into(),
        })?;
        sports.insert(sport, rules);
    }

    let mut categories = HashMap::new();
    for (key, rules) in file.categories {
        let category =
            Category::from_str_category(&key).ok_or_else(|| ConfigError::ValidationError {
                field: format!("categories.{key}"),
                message: "unknown category".into(),
            })?;
        categories.insert(category, rules);
    }

    let config = Config {
        league: LeagueConfig {
            name: file.league.name,
            sports,
        },
        categories: CategoryTable::new(categories),
        sync: file.sync,
        db_path: file.database.path,
        mirror_path: file.mirror.path,
    };

    validate(&config)?;

    Ok(config)
}

/// Ensure all config files exist by copying missing ones from `defaults/`.
/// Returns the list of files that were copied. Existing files are never
/// overwritten.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.exists() {
        if !config_dir.exists() {
            return Err(ConfigError::DefaultsCopyError {
                message: format!(
                    "neither defaults/ nor config/ directory found in {}",
                    base_dir.display()
                ),
            });
        }
        return Ok(vec![]);
    }

    std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to create config directory: {e}"),
    })?;

    let entries = std::fs::read_dir(&defaults_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to read defaults directory: {e}"),
    })?;

    let mut copied = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to read defaults entry: {e}"),
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name() else {
            continue;
        };
        let target = config_dir.join(file_name);

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
        {
            Ok(mut dest) => {
                let content = std::fs::read(&path).map_err(|e| ConfigError::DefaultsCopyError {
                    message: format!("failed to read {}: {e}", path.display()),
                })?;
                std::io::Write::write_all(&mut dest, &content).map_err(|e| {
                    ConfigError::DefaultsCopyError {
                        message: format!("failed to write {}: {e}", target.display()),
                    }
                })?;
                copied.push(target);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(ConfigError::DefaultsCopyError {
                    message: format!("failed to create {}: {e}", target.display()),
                });
            }
        }
    }

    Ok(copied)
}

/// Load config relative to the current working directory, copying defaults
/// first.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.into(),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.league.name.trim().is_empty() {
        return Err(invalid("league.name", "must not be empty"));
    }

    for category in Category::ALL {
        let rules = config.categories.rules(category);
        if rules.starting_bid == 0 {
            return Err(invalid(
                format!("categories.{category}.starting_bid"),
                "must be > 0",
            ));
        }
        if rules.increment == 0 {
            return Err(invalid(
                format!("categories.{category}.increment"),
                "must be > 0",
            ));
        }
    }

    let sync = &config.sync;
    if !(1..=999).contains(&sync.poll_interval_ms) {
        return Err(invalid(
            "sync.poll_interval_ms",
            format!("must be between 1 and 999, got {}", sync.poll_interval_ms),
        ));
    }
    if sync.roster_refresh_every == 0 {
        return Err(invalid("sync.roster_refresh_every", "must be > 0"));
    }
    if sync.countdown_tick_ms == 0 {
        return Err(invalid("sync.countdown_tick_ms", "must be > 0"));
    }
    if sync.min_teams_to_start == 0 {
        return Err(invalid("sync.min_teams_to_start", "must be at least 1"));
    }

    if config.db_path.trim().is_empty() {
        return Err(invalid("database.path", "must not be empty"));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Directory holding `defaults/` (works from the crate or workspace root).
    fn project_root() -> PathBuf {
        let cwd = std::env::current_dir().unwrap();
        if cwd.join("defaults").exists() {
            cwd
        } else if cwd.join("crates/gavel/defaults").exists() {
            cwd.join("crates/gavel")
        } else {
            panic!("Cannot locate defaults/ directory from CWD {:?}", cwd);
        }
    }

    /// Write `contents` as config/auction.toml under a fresh temp dir.
    fn write_config(name: &str, contents: &str) -> PathBuf {
        let tmp = std::env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("config")).unwrap();
        fs::write(tmp.join("config").join(CONFIG_FILE), contents).unwrap();
        tmp
    }

    fn default_text() -> String {
        fs::read_to_string(project_root().join("defaults").join(CONFIG_FILE)).unwrap()
    }

    fn expect_field(err: ConfigError, expected: &str) {
        match err {
            ConfigError::ValidationError { field, .. } => assert_eq!(field, expected),
            other => panic!("expected ValidationError for {expected}, got: {other}"),
        }
    }

    #[test]
    fn load_default_config() {
        let tmp = write_config("gavel_config_defaults", &default_text());
        let config = load_config_from(&tmp).expect("defaults should be valid");

        assert_eq!(config.league.name, "Inter-School Sports League");
        assert_eq!(config.categories.starting_bid(Category::District), 80);
        assert_eq!(config.categories.increment(Category::National), 25);
        assert_eq!(config.sync.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.sync.write_mode, WriteMode::Optimistic);
        assert_eq!(config.sync.countdown_expiry, CountdownExpiry::Signal);
        assert_eq!(config.db_path, "gavel.db");
        assert!(config.mirror_path.is_some());

        let football = config.league.rules(Sport::Football).unwrap();
        assert_eq!(football.min_players, 11);
        assert_eq!(football.players_needed(4), 7);

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let tmp = write_config(
            "gavel_config_minimal",
            "[league]\nname = \"Mini\"\n\n[database]\npath = \"mini.db\"\n",
        );
        let config = load_config_from(&tmp).unwrap();
        assert_eq!(config.sync.roster_refresh_every, 10);
        assert_eq!(config.sync.min_teams_to_start, 2);
        assert_eq!(config.categories.starting_bid(Category::School), 50);
        assert_eq!(config.mirror_path, None);
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn policies_parse_from_snake_case() {
        let text = default_text()
            .replace("write_mode = \"optimistic\"", "write_mode = \"confirmed\"")
            .replace("on_write_failure = \"keep\"", "on_write_failure = \"resync\"")
            .replace(
                "countdown_expiry = \"signal\"",
                "countdown_expiry = \"auto_resolve\"",
            );
        let tmp = write_config("gavel_config_policies", &text);
        let config = load_config_from(&tmp).unwrap();
        assert_eq!(config.sync.write_mode, WriteMode::Confirmed);
        assert_eq!(config.sync.on_write_failure, WriteFailurePolicy::Resync);
        assert_eq!(config.sync.countdown_expiry, CountdownExpiry::AutoResolve);
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_poll_interval_of_a_second() {
        let text = default_text().replace("poll_interval_ms = 500", "poll_interval_ms = 1000");
        let tmp = write_config("gavel_config_poll", &text);
        expect_field(load_config_from(&tmp).unwrap_err(), "sync.poll_interval_ms");
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_zero_increment() {
        let text = default_text().replace("increment = 10", "increment = 0");
        let tmp = write_config("gavel_config_increment", &text);
        expect_field(
            load_config_from(&tmp).unwrap_err(),
            "categories.district.increment",
        );
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_zero_min_teams() {
        let text = default_text().replace("min_teams_to_start = 2", "min_teams_to_start = 0");
        let tmp = write_config("gavel_config_min_teams", &text);
        expect_field(load_config_from(&tmp).unwrap_err(), "sync.min_teams_to_start");
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_unknown_sport() {
        let text = default_text().replace("[league.sports.football]", "[league.sports.cricket]");
        let tmp = write_config("gavel_config_sport", &text);
        expect_field(load_config_from(&tmp).unwrap_err(), "league.sports.cricket");
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn file_not_found_for_missing_config() {
        let tmp = std::env::temp_dir().join("gavel_config_missing");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();

        match load_config_from(&tmp).unwrap_err() {
            ConfigError::FileNotFound { path } => assert!(path.ends_with(CONFIG_FILE)),
            other => panic!("expected FileNotFound, got: {other}"),
        }
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn parse_error_for_invalid_toml() {
        let tmp = write_config("gavel_config_garbage", "this is [not toml");
        assert!(matches!(
            load_config_from(&tmp).unwrap_err(),
            ConfigError::ParseError { .. }
        ));
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn ensure_config_files_copies_then_skips() {
        let tmp = std::env::temp_dir().join("gavel_config_ensure");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("defaults")).unwrap();
        fs::write(tmp.join("defaults").join(CONFIG_FILE), default_text()).unwrap();

        let copied = ensure_config_files(&tmp).unwrap();
        assert_eq!(copied.len(), 1);
        assert!(tmp.join("config").join(CONFIG_FILE).exists());

        fs::write(tmp.join("config").join(CONFIG_FILE), "# custom\n").unwrap();
        assert!(ensure_config_files(&tmp).unwrap().is_empty());
        let content = fs::read_to_string(tmp.join("config").join(CONFIG_FILE)).unwrap();
        assert_eq!(content, "# custom\n");

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn ensure_config_files_errors_when_both_dirs_missing() {
        let tmp = std::env::temp_dir().join("gavel_config_both_missing");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();

        match ensure_config_files(&tmp).unwrap_err() {
            ConfigError::DefaultsCopyError { message } => {
                assert!(message.contains("neither defaults/ nor config/"));
            }
            other => panic!("expected DefaultsCopyError, got: {other}"),
        }
        let _ = fs::remove_dir_all(&tmp);
    }
}
