// Live auction runner.
//
// Startup sequence:
// 1. Initialize tracing (log to file)
// 2. Load config
// 3. Open database
// 4. `import <csv>`: load players and exit
// 5. Seed the engine from durable storage
// 6. Spawn the synchronizer
// 7. Print view changes until Ctrl+C
// 8. Shut down, draining queued writes

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use gavel::auction::{AuctionSnapshot, Sport};
use gavel::config::{self, LeagueConfig};
use gavel::db;
use gavel::import;
use gavel::mirror::LocalMirror;
use gavel::sync::{self, LocalView, SyncEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing
    init_tracing()?;
    info!("gavel-live starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: league={}, {} sport(s), write mode {:?}",
        config.league.name,
        config.league.sports.len(),
        config.sync.write_mode
    );

    // 3. Open database
    let db = db::Database::open(&config.db_path).context("failed to open database")?;
    info!("Database opened at {}", config.db_path);

    // 4. Import mode
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let [cmd, path] = args.as_slice() {
        if cmd == "import" {
            let summary = import::import_csv(&db, std::path::Path::new(path))
                .with_context(|| format!("failed to import {path}"))?;
            println!(
                "Imported {} new player(s) ({} read from {})",
                summary.inserted, summary.parsed, path
            );
            return Ok(());
        }
    }
    if !args.is_empty() {
        anyhow::bail!("usage: gavel-live [import <players.csv>]");
    }

    // 5. Seed the engine
    let store = Arc::new(db);
    let engine = sync::seed_engine(store.as_ref(), config.categories.clone())
        .await
        .context("failed to load auction state")?;

    // 6. Spawn the synchronizer
    let mirror = config.mirror_path.clone().map(LocalMirror::new);
    if let Some(mirror) = &mirror {
        info!("Sharing snapshots through {}", mirror.path().display());
    }
    let (handle, sync_task) = sync::spawn(store, engine, config.sync.clone(), mirror);
    info!("Synchronizer running; polling every {:?}", config.sync.poll_interval());

    // 7. Print view changes until Ctrl+C
    let mut view_rx = handle.watch();
    let mut events = handle.subscribe();
    print_view(&view_rx.borrow_and_update(), &config.league);
    loop {
        tokio::select! {
            changed = view_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                print_view(&view_rx.borrow_and_update(), &config.league);
            }
            event = events.recv() => {
                match event {
                    Ok(SyncEvent::CountdownExpired { player_id }) => {
                        println!("Countdown expired for player {player_id}");
                    }
                    Ok(SyncEvent::DurableWriteFailed { write, error }) => {
                        println!("Failed to save {write}: {error}");
                    }
                    Ok(SyncEvent::Reconciled { .. }) => {}
                    Err(RecvError::Lagged(n)) => warn!("Missed {} sync event(s)", n),
                    Err(RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received");
                break;
            }
        }
    }

    // 8. Shut down
    handle.shutdown().await;
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), sync_task).await;
    info!("gavel-live shut down cleanly");
    Ok(())
}

fn print_view(view: &LocalView, league: &LeagueConfig) {
    println!("{}", describe(&view.snapshot));
    if view.snapshot.is_active {
        return;
    }
    for sport in Sport::ALL {
        let sold = view
            .players
            .iter()
            .filter(|p| p.sport == sport && p.is_sold())
            .count();
        let mut teams = view.teams.iter().filter(|t| t.sport == sport).peekable();
        if teams.peek().is_none() {
            continue;
        }
        println!("{sport}: {sold} player(s) sold");
        for team in teams {
            let needed = league
                .rules(sport)
                .map(|rules| rules.players_needed(team.players.len()))
                .filter(|&n| n > 0)
                .map(|n| format!(", needs {n} more"))
                .unwrap_or_default();
            println!(
                "  {}: {}/{} left, {} player(s){}",
                team.name,
                team.remaining_budget,
                team.max_budget,
                team.players.len(),
                needed
            );
        }
    }
}

fn describe(snapshot: &AuctionSnapshot) -> String {
    let Some(player) = snapshot.current_player.as_ref().filter(|_| snapshot.is_active) else {
        return "No auction running".to_string();
    };
    let leader = match (snapshot.last_bid(), snapshot.current_bid) {
        (Some(bid), _) => format!("{} by {} (bid #{})", bid.amount, bid.team_name, bid.seq),
        (None, 0) => "no bids yet".to_string(),
        (None, bid) => format!("opening at {bid}"),
    };
    let countdown = snapshot
        .countdown
        .map(|s| format!(" [{s}s]"))
        .unwrap_or_default();
    format!(
        "{} ({}, {}): {}{}",
        player.name,
        player.sport,
        player.category,
        leader,
        countdown
    )
}

/// Initialize tracing to log to a file so stdout stays readable.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("gavel-live.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gavel=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
