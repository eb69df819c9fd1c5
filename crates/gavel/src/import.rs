// Player roster import from sign-up CSV exports.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::auction::{Category, NewPlayer, Sport};
use crate::db::Database;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("failed to read file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("row {row}: unknown sport {value:?}")]
    UnknownSport { row: usize, value: String },

    #[error("failed to store imported players: {0}")]
    Store(#[from] StoreError),
}

/// Counts reported after an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    /// Distinct players read from the file.
    pub parsed: usize,
    /// Players that were new to the database.
    pub inserted: usize,
}

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct RawPlayerRow {
    #[serde(default)]
    Name: String,
    #[serde(default)]
    Sport: String,
    #[serde(default, alias = "Achievement")]
    Category: String,
    #[serde(default)]
    Position: String,
    #[serde(default)]
    Photo: String,
}

/// Parse players from CSV with a header row (`Name`, `Sport`, `Category`,
/// `Position`, `Photo`). Rows without a name are skipped, as are repeats of
/// an earlier `(name, sport)`. An unrecognized sport fails the whole parse.
pub fn parse_players<R: Read>(rdr: R) -> Result<Vec<NewPlayer>, ImportError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(rdr);
    let mut seen = HashSet::new();
    let mut players = Vec::new();

    for (idx, result) in reader.deserialize::<RawPlayerRow>().enumerate() {
        let raw = result?;
        // Header is line 1.
        let row = idx + 2;
        if raw.Name.is_empty() {
            warn!("skipping row {}: missing name", row);
            continue;
        }
        let sport = Sport::from_str_sport(&raw.Sport).ok_or_else(|| ImportError::UnknownSport {
            row,
            value: raw.Sport.clone(),
        })?;
        if !seen.insert((raw.Name.to_lowercase(), sport)) {
            warn!("skipping row {}: duplicate {} ({})", row, raw.Name, sport);
            continue;
        }
        players.push(NewPlayer {
            name: raw.Name,
            sport,
            category: Category::from_achievement(&raw.Category),
            photo_url: raw.Photo,
            position: Some(raw.Position).filter(|p| !p.is_empty()),
        });
    }
    Ok(players)
}

/// Import a CSV file into the database in one transaction.
pub fn import_csv(db: &Database, path: &Path) -> Result<ImportSummary, ImportError> {
    let file = std::fs::File::open(path).map_err(|e| ImportError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let players = parse_players(file)?;
    let inserted = db.import_players(&players)?;
    info!(
        "Imported {} of {} players from {}",
        inserted,
        players.len(),
        path.display()
    );
    Ok(ImportSummary {
        parsed: players.len(),
        inserted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rows_and_maps_categories() {
        let csv = "\
Name,Sport,Category,Position,Photo
Asha Menon,Basketball,District,PG,https://img/asha.png
Leo Das,football,Schools,,
Kiran,Football,University,GK,
";
        let players = parse_players(csv.as_bytes()).unwrap();
        assert_eq!(players.len(), 3);

        assert_eq!(players[0].name, "Asha Menon");
        assert_eq!(players[0].sport, Sport::Basketball);
        assert_eq!(players[0].category, Category::District);
        assert_eq!(players[0].position.as_deref(), Some("PG"));
        assert_eq!(players[0].photo_url, "https://img/asha.png");

        assert_eq!(players[1].category, Category::School);
        assert_eq!(players[1].position, None);
        assert_eq!(players[2].category, Category::Others);
    }

    #[test]
    fn achievement_column_is_accepted() {
        let csv = "Name,Sport,Achievement\nAsha,Basketball,National\n";
        let players = parse_players(csv.as_bytes()).unwrap();
        assert_eq!(players[0].category, Category::National);
        assert_eq!(players[0].photo_url, "");
    }

    #[test]
    fn duplicates_and_nameless_rows_are_skipped() {
        let csv = "\
Name,Sport,Category
Asha,Basketball,State
asha,Basketball,District
Asha,Football,District
,Football,State
";
        let players = parse_players(csv.as_bytes()).unwrap();
        assert_eq!(players.len(), 2);
        assert_eq!(players[0].category, Category::State);
        assert_eq!(players[1].sport, Sport::Football);
    }

    #[test]
    fn unknown_sport_is_an_error() {
        let csv = "Name,Sport,Category\nAsha,Basketball,State\nRaj,Cricket,State\n";
        match parse_players(csv.as_bytes()).unwrap_err() {
            ImportError::UnknownSport { row, value } => {
                assert_eq!(row, 3);
                assert_eq!(value, "Cricket");
            }
            other => panic!("expected UnknownSport, got: {other}"),
        }
    }

    #[test]
    fn import_csv_inserts_once() {
        let dir = std::env::temp_dir().join("gavel_import_once");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("players.csv");
        std::fs::write(&path, "Name,Sport,Category\nAsha,Basketball,State\nLeo,Football,School\n")
            .unwrap();

        let db = Database::open(":memory:").unwrap();
        let first = import_csv(&db, &path).unwrap();
        assert_eq!(first, ImportSummary { parsed: 2, inserted: 2 });
        let second = import_csv(&db, &path).unwrap();
        assert_eq!(second, ImportSummary { parsed: 2, inserted: 0 });

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_is_io_error() {
        let db = Database::open(":memory:").unwrap();
        let err = import_csv(&db, Path::new("/nonexistent/players.csv")).unwrap_err();
        assert!(matches!(err, ImportError::Io { .. }));
    }
}
