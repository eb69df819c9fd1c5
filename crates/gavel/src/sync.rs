// Synchronization layer.
//
// `Synchronizer` owns the auction engine and is its only writer. Callers talk
// to it through a cloneable `SyncHandle`. Local mutations are applied first
// (optimistic mode) and queued for a single background writer, so durable
// writes land in call order. A fixed-interval pull reconciles the local copy
// with durable storage, last pull wins.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::auction::{
    compute_snapshot_diff, AuctionEngine, AuctionError, AuctionSnapshot, Bid, CategoryTable,
    CountdownTick, NewPlayer, NewTeam, Player, PlayerId, PlayerUpdate, ResetOutcome, Sale,
    SnapshotDiff, Sport, Team, TeamId, Unsold,
};
use crate::config::{CountdownExpiry, SyncConfig, WriteFailurePolicy, WriteMode};
use crate::mirror::LocalMirror;
use crate::store::{AuctionStore, DurableWrite, SnapshotRead, StoreError};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Auction(#[from] AuctionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{sport} has {available} team(s); {required} are needed to start an auction")]
    NotEnoughTeams {
        sport: Sport,
        available: usize,
        required: usize,
    },

    #[error("synchronizer is not running")]
    Closed,
}

/// Everything an observer renders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalView {
    pub snapshot: AuctionSnapshot,
    pub players: Vec<Player>,
    pub teams: Vec<Team>,
}

/// Discrete notifications for observers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    CountdownExpired {
        player_id: PlayerId,
    },
    /// A background durable write failed after the local state changed.
    DurableWriteFailed {
        write: DurableWrite,
        error: String,
    },
    /// A pulled durable snapshot replaced the local one.
    Reconciled {
        diff: SnapshotDiff,
    },
}

/// Resolves once the durable write behind a local change has landed.
#[derive(Debug)]
pub struct WriteReceipt(oneshot::Receiver<Result<(), StoreError>>);

impl WriteReceipt {
    fn settled(result: Result<(), StoreError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        WriteReceipt(rx)
    }

    /// Wait for the durable write.
    pub async fn confirmed(self) -> Result<(), SyncError> {
        match self.0.await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::Closed),
        }
    }
}

/// The result of a local mutation plus a receipt for its durable write.
#[derive(Debug)]
pub struct Applied<T> {
    pub value: T,
    pub durable: WriteReceipt,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

enum Command {
    Start {
        player_id: PlayerId,
        starting_bid: Option<u32>,
        reply: Reply<Applied<AuctionSnapshot>>,
    },
    Bid {
        team_id: TeamId,
        team_name: String,
        amount: u32,
        reply: Reply<Applied<Bid>>,
    },
    UndoBid {
        reply: Reply<Applied<Option<Bid>>>,
    },
    Sold {
        team_id: TeamId,
        amount: u32,
        reply: Reply<Applied<Sale>>,
    },
    Unsold {
        reply: Reply<Applied<Unsold>>,
    },
    Cancel {
        reply: Reply<Applied<PlayerId>>,
    },
    Reset {
        sport: Option<Sport>,
        reply: Reply<Applied<ResetOutcome>>,
    },
    SetCountdown {
        value: Option<u32>,
        reply: Reply<()>,
    },
    NextBid {
        reply: oneshot::Sender<Option<u32>>,
    },
    CreatePlayer {
        player: NewPlayer,
        reply: Reply<Player>,
    },
    UpdatePlayer {
        player_id: PlayerId,
        update: PlayerUpdate,
        reply: Reply<Player>,
    },
    DeletePlayer {
        player_id: PlayerId,
        reply: Reply<()>,
    },
    CreateTeam {
        team: NewTeam,
        reply: Reply<Team>,
    },
    DeleteTeam {
        team_id: TeamId,
        reply: Reply<()>,
    },
    Refresh {
        reply: Reply<()>,
    },
    Shutdown,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable front end to a running `Synchronizer`.
#[derive(Clone)]
pub struct SyncHandle {
    cmd_tx: mpsc::Sender<Command>,
    view_rx: watch::Receiver<LocalView>,
    events_tx: broadcast::Sender<SyncEvent>,
}

impl SyncHandle {
    /// The latest view.
    pub fn view(&self) -> LocalView {
        self.view_rx.borrow().clone()
    }

    /// A receiver that wakes on every view change.
    pub fn watch(&self) -> watch::Receiver<LocalView> {
        self.view_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events_tx.subscribe()
    }

    pub async fn start_auction(
        &self,
        player_id: PlayerId,
        starting_bid: Option<u32>,
    ) -> Result<Applied<AuctionSnapshot>, SyncError> {
        self.request(|reply| Command::Start {
            player_id,
            starting_bid,
            reply,
        })
        .await?
    }

    pub async fn place_bid(
        &self,
        team_id: TeamId,
        team_name: &str,
        amount: u32,
    ) -> Result<Applied<Bid>, SyncError> {
        let team_name = team_name.to_string();
        self.request(|reply| Command::Bid {
            team_id,
            team_name,
            amount,
            reply,
        })
        .await?
    }

    pub async fn undo_last_bid(&self) -> Result<Applied<Option<Bid>>, SyncError> {
        self.request(|reply| Command::UndoBid { reply }).await?
    }

    pub async fn sold(&self, team_id: TeamId, amount: u32) -> Result<Applied<Sale>, SyncError> {
        self.request(|reply| Command::Sold {
            team_id,
            amount,
            reply,
        })
        .await?
    }

    pub async fn unsold(&self) -> Result<Applied<Unsold>, SyncError> {
        self.request(|reply| Command::Unsold { reply }).await?
    }

    pub async fn cancel_auction(&self) -> Result<Applied<PlayerId>, SyncError> {
        self.request(|reply| Command::Cancel { reply }).await?
    }

    pub async fn reset_auction(
        &self,
        sport: Option<Sport>,
    ) -> Result<Applied<ResetOutcome>, SyncError> {
        self.request(|reply| Command::Reset { sport, reply }).await?
    }

    pub async fn set_countdown(&self, value: Option<u32>) -> Result<(), SyncError> {
        self.request(|reply| Command::SetCountdown { value, reply })
            .await?
    }

    pub async fn next_bid_amount(&self) -> Result<Option<u32>, SyncError> {
        self.request(|reply| Command::NextBid { reply }).await
    }

    pub async fn create_player(&self, player: NewPlayer) -> Result<Player, SyncError> {
        self.request(|reply| Command::CreatePlayer { player, reply })
            .await?
    }

    pub async fn update_player(
        &self,
        player_id: PlayerId,
        update: PlayerUpdate,
    ) -> Result<Player, SyncError> {
        self.request(|reply| Command::UpdatePlayer {
            player_id,
            update,
            reply,
        })
        .await?
    }

    pub async fn delete_player(&self, player_id: PlayerId) -> Result<(), SyncError> {
        self.request(|reply| Command::DeletePlayer { player_id, reply })
            .await?
    }

    pub async fn create_team(&self, team: NewTeam) -> Result<Team, SyncError> {
        self.request(|reply| Command::CreateTeam { team, reply })
            .await?
    }

    pub async fn delete_team(&self, team_id: TeamId) -> Result<(), SyncError> {
        self.request(|reply| Command::DeleteTeam { team_id, reply })
            .await?
    }

    /// Pull the durable snapshot and reference data now, regardless of
    /// in-flight writes.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Refresh { reply }).await?
    }

    /// Stop the synchronizer. Queued durable writes are drained first.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Background writer
// ---------------------------------------------------------------------------

struct WriteJob {
    write: DurableWrite,
    reply: oneshot::Sender<Result<(), StoreError>>,
}

struct WriteOutcome {
    write: DurableWrite,
    error: Option<String>,
}

/// Apply queued writes strictly in order, one at a time.
async fn write_loop<S: AuctionStore + ?Sized>(
    store: Arc<S>,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    outcomes: mpsc::UnboundedSender<WriteOutcome>,
) {
    while let Some(job) = jobs.recv().await {
        let result = store.apply(&job.write).await;
        let error = result.as_ref().err().map(|e| e.to_string());
        match &error {
            None => debug!("Durable write ok: {}", job.write),
            Some(e) => error!("Durable write failed: {}: {}", job.write, e),
        }
        let _ = outcomes.send(WriteOutcome {
            write: job.write,
            error,
        });
        let _ = job.reply.send(result);
    }
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

/// Load players, teams and the durable snapshot into a fresh engine.
pub async fn seed_engine<S: AuctionStore + ?Sized>(
    store: &S,
    categories: CategoryTable,
) -> Result<AuctionEngine, StoreError> {
    let players = store.load_players().await?;
    let teams = store.load_teams().await?;
    let mut engine = AuctionEngine::new(categories, players, teams);
    if let SnapshotRead::Changed { snapshot, .. } = store.read_snapshot(None).await? {
        engine.adopt_snapshot(snapshot);
    }
    info!(
        "Engine seeded: {} players, {} teams, auction active: {}",
        engine.players().len(),
        engine.teams().len(),
        engine.is_active()
    );
    Ok(engine)
}

pub struct Synchronizer<S: AuctionStore + ?Sized + 'static> {
    store: Arc<S>,
    config: SyncConfig,
    engine: AuctionEngine,
    mirror: Option<LocalMirror>,
    /// Stamp of the last durable snapshot applied; `None` forces a full read.
    last_stamp: Option<u64>,
    /// Durable writes queued or running. Reconciliation waits for zero.
    pending_writes: usize,
    polls: u64,
    cmd_rx: mpsc::Receiver<Command>,
    view_tx: watch::Sender<LocalView>,
    events_tx: broadcast::Sender<SyncEvent>,
    write_tx: mpsc::UnboundedSender<WriteJob>,
    write_rx: Option<mpsc::UnboundedReceiver<WriteJob>>,
}

/// Spawn a synchronizer on the current runtime.
pub fn spawn<S: AuctionStore + ?Sized + 'static>(
    store: Arc<S>,
    engine: AuctionEngine,
    config: SyncConfig,
    mirror: Option<LocalMirror>,
) -> (SyncHandle, JoinHandle<()>) {
    let (sync, handle) = Synchronizer::new(store, engine, config, mirror);
    (handle, tokio::spawn(sync.run()))
}

impl<S: AuctionStore + ?Sized + 'static> Synchronizer<S> {
    pub fn new(
        store: Arc<S>,
        engine: AuctionEngine,
        config: SyncConfig,
        mirror: Option<LocalMirror>,
    ) -> (Self, SyncHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (view_tx, view_rx) = watch::channel(view_of(&engine));
        let (events_tx, _) = broadcast::channel(64);
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        let handle = SyncHandle {
            cmd_tx,
            view_rx,
            events_tx: events_tx.clone(),
        };
        let sync = Synchronizer {
            store,
            config,
            engine,
            mirror,
            last_stamp: None,
            pending_writes: 0,
            polls: 0,
            cmd_rx,
            view_tx,
            events_tx,
            write_tx,
            write_rx: Some(write_rx),
        };
        (sync, handle)
    }

    /// Run until shut down or until every handle is dropped.
    pub async fn run(mut self) {
        info!("Synchronizer started");
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let writer = self
            .write_rx
            .take()
            .map(|jobs| tokio::spawn(write_loop(self.store.clone(), jobs, outcome_tx)));

        let mut poll_interval = tokio::time::interval(self.config.poll_interval());
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut countdown_interval = tokio::time::interval(self.config.countdown_tick());
        countdown_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; consume it.
        poll_interval.tick().await;
        countdown_interval.tick().await;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            info!("Synchronizer shutting down");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }

                Some(outcome) = outcome_rx.recv() => {
                    self.handle_write_outcome(outcome).await;
                }

                _ = poll_interval.tick() => {
                    self.poll().await;
                }

                _ = countdown_interval.tick() => {
                    self.on_countdown_tick().await;
                }
            }
        }

        // Dropping the job sender lets the writer drain and exit.
        drop(self);
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        info!("Synchronizer stopped");
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start {
                player_id,
                starting_bid,
                reply,
            } => {
                let result = self.start_auction(player_id, starting_bid).await;
                let _ = reply.send(result);
            }
            Command::Bid {
                team_id,
                team_name,
                amount,
                reply,
            } => {
                let result = self
                    .mutate(|engine| {
                        let bid = engine.place_bid(team_id, &team_name, amount)?;
                        let write = DurableWrite::Bid {
                            player_id: bid.player_id,
                            team_id,
                            amount,
                        };
                        Ok((bid, Some(write)))
                    })
                    .await;
                let _ = reply.send(result);
            }
            Command::UndoBid { reply } => {
                let result = self
                    .mutate(|engine| {
                        let removed = engine.undo_last_bid()?;
                        let write = removed.as_ref().map(|bid| DurableWrite::UndoBid {
                            player_id: bid.player_id,
                        });
                        Ok((removed, write))
                    })
                    .await;
                let _ = reply.send(result);
            }
            Command::Sold {
                team_id,
                amount,
                reply,
            } => {
                let result = self.sell(team_id, amount).await;
                let _ = reply.send(result);
            }
            Command::Unsold { reply } => {
                let result = self.pass().await;
                let _ = reply.send(result);
            }
            Command::Cancel { reply } => {
                let result = self
                    .mutate(|engine| {
                        let player_id = engine.cancel_auction()?;
                        Ok((player_id, Some(DurableWrite::Cancel { player_id })))
                    })
                    .await;
                let _ = reply.send(result);
            }
            Command::Reset { sport, reply } => {
                let result = self
                    .mutate(|engine| {
                        let outcome = engine.reset_auction(sport);
                        Ok((outcome, Some(DurableWrite::Reset { sport })))
                    })
                    .await;
                let _ = reply.send(result);
            }
            Command::SetCountdown { value, reply } => {
                let result = self.engine.set_countdown(value).map_err(SyncError::from);
                if result.is_ok() {
                    self.publish_view();
                }
                let _ = reply.send(result);
            }
            Command::NextBid { reply } => {
                let _ = reply.send(self.engine.next_bid_amount());
            }
            Command::CreatePlayer { player, reply } => {
                let result = self.store.create_player(&player).await.map_err(SyncError::from);
                if let Ok(created) = &result {
                    info!("Player added: {} ({})", created.name, created.sport);
                    self.engine.upsert_player(created.clone());
                    self.publish_view();
                }
                let _ = reply.send(result);
            }
            Command::UpdatePlayer {
                player_id,
                update,
                reply,
            } => {
                let result = self
                    .store
                    .update_player(player_id, &update)
                    .await
                    .map_err(SyncError::from);
                if let Ok(updated) = &result {
                    self.engine.upsert_player(updated.clone());
                    self.publish_view();
                }
                let _ = reply.send(result);
            }
            Command::DeletePlayer { player_id, reply } => {
                let result = self.delete_player(player_id).await;
                let _ = reply.send(result);
            }
            Command::CreateTeam { team, reply } => {
                let result = self.store.create_team(&team).await.map_err(SyncError::from);
                if let Ok(created) = &result {
                    info!("Team added: {} ({}, {} points)", created.name, created.sport, created.max_budget);
                    self.engine.upsert_team(created.clone());
                    self.publish_view();
                }
                let _ = reply.send(result);
            }
            Command::DeleteTeam { team_id, reply } => {
                let result = self.delete_team(team_id).await;
                let _ = reply.send(result);
            }
            Command::Refresh { reply } => {
                self.last_stamp = None;
                let result = self.pull(true).await;
                let result = match result {
                    Ok(()) => self.refresh_reference_data().await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Shutdown => {}
        }
    }

    async fn start_auction(
        &mut self,
        player_id: PlayerId,
        starting_bid: Option<u32>,
    ) -> Result<Applied<AuctionSnapshot>, SyncError> {
        let sport = self
            .engine
            .player(player_id)
            .map(|p| p.sport)
            .ok_or(AuctionError::UnknownPlayer(player_id))?;
        let available = self.engine.teams_for_sport(sport).count();
        let required = self.config.min_teams_to_start;
        if available < required {
            return Err(SyncError::NotEnoughTeams {
                sport,
                available,
                required,
            });
        }

        self.mutate(|engine| {
            let snapshot = engine.start_auction(player_id, starting_bid)?.clone();
            let write = DurableWrite::Start {
                player_id,
                sport,
                opening_bid: snapshot.opening_bid,
            };
            Ok((snapshot, Some(write)))
        })
        .await
    }

    async fn sell(&mut self, team_id: TeamId, amount: u32) -> Result<Applied<Sale>, SyncError> {
        self.mutate(|engine| {
            let sale = engine.sold(team_id, amount)?;
            let write = DurableWrite::Sold {
                player_id: sale.player_id,
                team_id,
                amount,
            };
            Ok((sale, Some(write)))
        })
        .await
    }

    async fn pass(&mut self) -> Result<Applied<Unsold>, SyncError> {
        self.mutate(|engine| {
            let outcome = engine.unsold()?;
            let write = DurableWrite::Unsold {
                player_id: outcome.player_id,
            };
            Ok((outcome, Some(write)))
        })
        .await
    }

    async fn delete_player(&mut self, player_id: PlayerId) -> Result<(), SyncError> {
        let mut staged = self.engine.clone();
        staged.remove_player(player_id)?;
        self.store.delete_player(player_id).await?;
        self.engine = staged;
        self.publish_view();
        Ok(())
    }

    async fn delete_team(&mut self, team_id: TeamId) -> Result<(), SyncError> {
        let mut staged = self.engine.clone();
        staged.remove_team(team_id)?;
        self.store.delete_team(team_id).await?;
        self.engine = staged;
        self.publish_view();
        Ok(())
    }

    /// Apply an engine operation according to the write mode.
    ///
    /// Optimistic: mutate now, publish, and queue the durable write.
    /// Confirmed: mutate a copy, wait for the durable write, then commit.
    async fn mutate<T, F>(&mut self, op: F) -> Result<Applied<T>, SyncError>
    where
        F: FnOnce(&mut AuctionEngine) -> Result<(T, Option<DurableWrite>), AuctionError>,
    {
        match self.config.write_mode {
            WriteMode::Optimistic => {
                let (value, write) = op(&mut self.engine)?;
                self.publish_local();
                let durable = match write {
                    Some(write) => self.enqueue(write),
                    None => WriteReceipt::settled(Ok(())),
                };
                Ok(Applied { value, durable })
            }
            WriteMode::Confirmed => {
                let mut staged = self.engine.clone();
                let (value, write) = op(&mut staged)?;
                if let Some(write) = write {
                    self.enqueue(write).confirmed().await?;
                }
                self.engine = staged;
                self.publish_local();
                Ok(Applied {
                    value,
                    durable: WriteReceipt::settled(Ok(())),
                })
            }
        }
    }

    fn enqueue(&mut self, write: DurableWrite) -> WriteReceipt {
        let (reply, rx) = oneshot::channel();
        match self.write_tx.send(WriteJob { write, reply }) {
            Ok(()) => {
                self.pending_writes += 1;
                WriteReceipt(rx)
            }
            // The writer only stops after the loop exits.
            Err(_) => WriteReceipt(rx),
        }
    }

    async fn handle_write_outcome(&mut self, outcome: WriteOutcome) {
        self.pending_writes = self.pending_writes.saturating_sub(1);
        let Some(error) = outcome.error else {
            return;
        };

        let _ = self.events_tx.send(SyncEvent::DurableWriteFailed {
            write: outcome.write,
            error,
        });
        match self.config.on_write_failure {
            WriteFailurePolicy::Keep => {
                warn!("Keeping optimistic state after failed write; it stays until a later durable write or a refresh");
            }
            WriteFailurePolicy::Resync => {
                warn!("Resyncing from durable storage after failed write");
                self.last_stamp = None;
                if let Err(e) = self.pull(true).await {
                    warn!("Resync pull failed: {}", e);
                }
                if let Err(e) = self.refresh_reference_data().await {
                    warn!("Resync reference reload failed: {}", e);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Polling and reconciliation
    // ------------------------------------------------------------------

    async fn poll(&mut self) {
        self.polls += 1;
        self.apply_mirror().await;

        if self.pending_writes > 0 {
            debug!("Skipping reconciliation: {} write(s) in flight", self.pending_writes);
            return;
        }

        if let Err(e) = self.pull(false).await {
            warn!("Snapshot pull failed: {}", e);
        }
        if self.polls % u64::from(self.config.roster_refresh_every.max(1)) == 0 {
            if let Err(e) = self.refresh_reference_data().await {
                warn!("Reference data refresh failed: {}", e);
            }
        }
    }

    async fn apply_mirror(&mut self) {
        let Some(mirror) = self.mirror.as_mut() else {
            return;
        };
        let snapshot = match mirror.poll() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return,
            Err(e) => {
                warn!("Mirror read failed: {}", e);
                return;
            }
        };
        let diff = compute_snapshot_diff(self.engine.snapshot(), &snapshot);
        if diff.is_empty() {
            return;
        }
        debug!("Mirror update: {:?}", diff);
        let ended = diff.activity_changed && !snapshot.is_active;
        self.engine.adopt_snapshot(snapshot);
        self.publish_view();

        // The peer's durable write may still be queued; the next changed
        // pull reloads again.
        if ended {
            if let Err(e) = self.refresh_reference_data().await {
                warn!("Reference data refresh failed: {}", e);
            }
        }
    }

    /// Read the durable snapshot and adopt it when it differs.
    async fn pull(&mut self, forced: bool) -> Result<(), SyncError> {
        let read = self.store.read_snapshot(self.last_stamp).await?;
        let SnapshotRead::Changed { stamp, snapshot } = read else {
            return Ok(());
        };
        self.last_stamp = Some(stamp);

        // Durable state moved while idle: a sale, pass or reset landed, so
        // budgets and rosters may have changed even if the snapshot did not
        // (the mirror can deliver the idle snapshot first).
        let reload = !snapshot.is_active;
        let diff = compute_snapshot_diff(self.engine.snapshot(), &snapshot);
        if !diff.is_empty() || forced {
            if !diff.is_empty() {
                info!("Reconciled with durable snapshot (stamp {}): {:?}", stamp, diff);
            }
            self.engine.adopt_snapshot(snapshot);
            self.publish_view();
            if !diff.is_empty() {
                let _ = self.events_tx.send(SyncEvent::Reconciled { diff });
            }
        }

        if reload {
            self.refresh_reference_data().await?;
        }
        Ok(())
    }

    async fn refresh_reference_data(&mut self) -> Result<(), SyncError> {
        let players = self.store.load_players().await?;
        let teams = self.store.load_teams().await?;
        if players != self.engine.players() || teams != self.engine.teams() {
            debug!("Reference data changed: {} players, {} teams", players.len(), teams.len());
            self.engine.replace_reference_data(players, teams);
            self.publish_view();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Countdown
    // ------------------------------------------------------------------

    async fn on_countdown_tick(&mut self) {
        match self.engine.tick_countdown() {
            CountdownTick::Idle => {}
            CountdownTick::Running(left) => {
                debug!("Countdown: {}s", left);
                self.publish_view();
            }
            CountdownTick::Expired => {
                self.publish_view();
                let Some(player_id) = self.engine.snapshot().current_player_id() else {
                    return;
                };
                info!("Countdown expired for player {}", player_id);
                let _ = self.events_tx.send(SyncEvent::CountdownExpired { player_id });
                if self.config.countdown_expiry == CountdownExpiry::AutoResolve {
                    self.auto_resolve().await;
                }
            }
        }
    }

    /// Sell to the leading bidder at the current bid, else mark unsold.
    async fn auto_resolve(&mut self) {
        let bidder = self.engine.snapshot().current_bidder_id;
        let amount = self.engine.snapshot().current_bid;
        let result = match bidder {
            Some(team_id) => self.sell(team_id, amount).await.map(|_| ()),
            None => self.pass().await.map(|_| ()),
        };
        if let Err(e) = result {
            warn!("Automatic resolution failed: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------

    /// Publish to observers only when the view actually changed.
    fn publish_view(&self) {
        let next = view_of(&self.engine);
        self.view_tx.send_if_modified(|view| {
            if *view == next {
                false
            } else {
                *view = next;
                true
            }
        });
    }

    /// Publish a local mutation to observers and to same-device peers.
    fn publish_local(&mut self) {
        self.publish_view();
        if let Some(mirror) = self.mirror.as_mut() {
            if let Err(e) = mirror.publish(self.engine.snapshot()) {
                warn!("Mirror publish failed: {}", e);
            }
        }
    }
}

fn view_of(engine: &AuctionEngine) -> LocalView {
    LocalView {
        snapshot: engine.snapshot().clone(),
        players: engine.players().to_vec(),
        teams: engine.teams().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::Category;
    use crate::db::Database;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Wraps the database and fails every engine-driven write while `failing`
    /// is set.
    struct FlakyStore {
        db: Database,
        failing: AtomicBool,
    }

    #[async_trait]
    impl AuctionStore for FlakyStore {
        async fn record_start(&self, p: PlayerId, s: Sport, b: u32) -> Result<i64, StoreError> {
            self.db.record_start(p, s, b)
        }
        async fn record_bid(&self, p: PlayerId, t: TeamId, a: u32) -> Result<(), StoreError> {
            self.db.record_bid(p, t, a)
        }
        async fn record_undo_bid(&self, p: PlayerId) -> Result<(), StoreError> {
            self.db.record_undo_bid(p)
        }
        async fn record_sold(&self, p: PlayerId, t: TeamId, a: u32) -> Result<(), StoreError> {
            self.db.record_sold(p, t, a)
        }
        async fn record_unsold(&self, p: PlayerId) -> Result<Option<(TeamId, u32)>, StoreError> {
            self.db.record_unsold(p)
        }
        async fn record_cancel(&self, p: PlayerId) -> Result<(), StoreError> {
            self.db.record_cancel(p)
        }
        async fn record_reset(&self, s: Option<Sport>) -> Result<(), StoreError> {
            self.db.record_reset(s)
        }
        async fn read_snapshot(&self, since: Option<u64>) -> Result<SnapshotRead, StoreError> {
            self.db.read_snapshot(since)
        }
        async fn load_players(&self) -> Result<Vec<Player>, StoreError> {
            self.db.load_players()
        }
        async fn load_teams(&self) -> Result<Vec<Team>, StoreError> {
            self.db.load_teams()
        }
        async fn create_player(&self, p: &NewPlayer) -> Result<Player, StoreError> {
            self.db.create_player(p)
        }
        async fn update_player(&self, id: PlayerId, u: &PlayerUpdate) -> Result<Player, StoreError> {
            self.db.update_player(id, u)
        }
        async fn delete_player(&self, id: PlayerId) -> Result<(), StoreError> {
            self.db.delete_player(id)
        }
        async fn create_team(&self, t: &NewTeam) -> Result<Team, StoreError> {
            self.db.create_team(t)
        }
        async fn delete_team(&self, id: TeamId) -> Result<(), StoreError> {
            self.db.delete_team(id)
        }
        async fn apply(&self, write: &DurableWrite) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::NoActiveAuction(0));
            }
            self.db.apply(write).await
        }
    }

    struct Fixture {
        store: Arc<FlakyStore>,
        team_a: TeamId,
        team_b: TeamId,
        player: PlayerId,
    }

    /// Team A (500) and Team B (60) in basketball, one district player.
    fn fixture() -> Fixture {
        let db = Database::open(":memory:").unwrap();
        let team_a = db
            .create_team(&NewTeam {
                name: "Team A".into(),
                sport: Sport::Basketball,
                max_budget: 500,
            })
            .unwrap()
            .id;
        let team_b = db
            .create_team(&NewTeam {
                name: "Team B".into(),
                sport: Sport::Basketball,
                max_budget: 60,
            })
            .unwrap()
            .id;
        let player = db
            .create_player(&NewPlayer {
                name: "Asha".into(),
                sport: Sport::Basketball,
                category: Category::District,
                photo_url: String::new(),
                position: None,
            })
            .unwrap()
            .id;
        Fixture {
            store: Arc::new(FlakyStore {
                db,
                failing: AtomicBool::new(false),
            }),
            team_a,
            team_b,
            player,
        }
    }

    async fn start(fx: &Fixture, config: SyncConfig) -> (SyncHandle, JoinHandle<()>) {
        let engine = seed_engine(fx.store.as_ref(), CategoryTable::default())
            .await
            .unwrap();
        spawn(fx.store.clone(), engine, config, None)
    }

    async fn wait_for_view(handle: &SyncHandle, pred: impl FnMut(&LocalView) -> bool) {
        let mut rx = handle.watch();
        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(pred))
            .await
            .expect("view condition not reached in time")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn optimistic_bid_is_visible_before_durable_write() {
        let fx = fixture();
        let (handle, task) = start(&fx, SyncConfig::default()).await;

        handle
            .start_auction(fx.player, None)
            .await
            .unwrap()
            .durable
            .confirmed()
            .await
            .unwrap();
        let applied = handle.place_bid(fx.team_a, "Team A", 80).await.unwrap();
        assert_eq!(applied.value.amount, 80);
        assert_eq!(handle.view().snapshot.current_bid, 80);

        applied.durable.confirmed().await.unwrap();
        match fx.store.db.read_snapshot(None).unwrap() {
            SnapshotRead::Changed { snapshot, .. } => assert_eq!(snapshot.current_bid, 80),
            other => panic!("unexpected read {other:?}"),
        }

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn validation_errors_leave_view_unchanged() {
        let fx = fixture();
        let (handle, _task) = start(&fx, SyncConfig::default()).await;
        handle.start_auction(fx.player, None).await.unwrap();
        handle.place_bid(fx.team_a, "Team A", 80).await.unwrap();
        let before = handle.view();

        let err = handle.place_bid(fx.team_b, "Team B", 90).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Auction(AuctionError::InsufficientBudget { .. })
        ));
        assert_eq!(handle.view(), before);
        assert_eq!(handle.next_bid_amount().await.unwrap(), Some(90));
    }

    #[tokio::test(start_paused = true)]
    async fn start_requires_enough_teams() {
        let fx = fixture();
        let config = SyncConfig {
            min_teams_to_start: 3,
            ..SyncConfig::default()
        };
        let (handle, _task) = start(&fx, config).await;

        let err = handle.start_auction(fx.player, None).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::NotEnoughTeams {
                available: 2,
                required: 3,
                ..
            }
        ));
        assert!(!handle.view().snapshot.is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn durable_changes_from_elsewhere_are_pulled() {
        let fx = fixture();
        let (handle, _task) = start(&fx, SyncConfig::default()).await;

        // Another device starts an auction and bids directly on storage.
        fx.store.db.record_start(fx.player, Sport::Basketball, 0).unwrap();
        fx.store.db.record_bid(fx.player, fx.team_a, 80).unwrap();

        let mut events = handle.subscribe();
        wait_for_view(&handle, |v| v.snapshot.current_bid == 80).await;
        let view = handle.view();
        assert!(view.snapshot.is_active);
        assert_eq!(view.snapshot.current_bidder_name.as_deref(), Some("Team A"));
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::Reconciled { .. }
        ));

        // The other device sells; budgets follow without waiting for the
        // periodic refresh.
        fx.store.db.record_sold(fx.player, fx.team_a, 80).unwrap();
        wait_for_view(&handle, |v| {
            !v.snapshot.is_active
                && v.teams.iter().any(|t| t.id == fx.team_a && t.remaining_budget == 420)
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_keeps_optimistic_state_and_reports() {
        let fx = fixture();
        let (handle, _task) = start(&fx, SyncConfig::default()).await;
        let mut events = handle.subscribe();
        handle
            .start_auction(fx.player, None)
            .await
            .unwrap()
            .durable
            .confirmed()
            .await
            .unwrap();

        fx.store.failing.store(true, Ordering::SeqCst);
        let applied = handle.place_bid(fx.team_a, "Team A", 80).await.unwrap();
        assert!(applied.durable.confirmed().await.is_err());
        assert_eq!(handle.view().snapshot.current_bid, 80);

        match events.recv().await.unwrap() {
            SyncEvent::DurableWriteFailed { write, .. } => {
                assert!(matches!(write, DurableWrite::Bid { amount: 80, .. }));
            }
            other => panic!("expected DurableWriteFailed, got {other:?}"),
        }

        // The stamp did not move, so polls leave the divergence in place.
        fx.store.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(SyncConfig::default().poll_interval() * 4).await;
        assert_eq!(handle.view().snapshot.current_bid, 80);

        handle.refresh().await.unwrap();
        assert_eq!(handle.view().snapshot.current_bid, 0);
        assert!(handle.view().snapshot.bids.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_with_resync_restores_durable_state() {
        let fx = fixture();
        let config = SyncConfig {
            on_write_failure: WriteFailurePolicy::Resync,
            ..SyncConfig::default()
        };
        let (handle, _task) = start(&fx, config).await;
        handle
            .start_auction(fx.player, None)
            .await
            .unwrap()
            .durable
            .confirmed()
            .await
            .unwrap();

        fx.store.failing.store(true, Ordering::SeqCst);
        let applied = handle.place_bid(fx.team_a, "Team A", 80).await.unwrap();
        assert!(applied.durable.confirmed().await.is_err());

        wait_for_view(&handle, |v| v.snapshot.is_active && v.snapshot.bids.is_empty()).await;
        assert_eq!(handle.view().snapshot.current_bid, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_mode_does_not_commit_failed_writes() {
        let fx = fixture();
        let config = SyncConfig {
            write_mode: WriteMode::Confirmed,
            ..SyncConfig::default()
        };
        let (handle, _task) = start(&fx, config).await;
        handle.start_auction(fx.player, None).await.unwrap();

        fx.store.failing.store(true, Ordering::SeqCst);
        let err = handle.place_bid(fx.team_a, "Team A", 80).await.unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
        assert_eq!(handle.view().snapshot.current_bid, 0);
        assert!(handle.view().snapshot.bids.is_empty());

        fx.store.failing.store(false, Ordering::SeqCst);
        handle.place_bid(fx.team_a, "Team A", 80).await.unwrap();
        assert_eq!(handle.view().snapshot.current_bid, 80);
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_signal_leaves_auction_running() {
        let fx = fixture();
        let (handle, _task) = start(&fx, SyncConfig::default()).await;
        let mut events = handle.subscribe();
        handle.start_auction(fx.player, None).await.unwrap();
        handle.set_countdown(Some(2)).await.unwrap();

        let expired = loop {
            match events.recv().await.unwrap() {
                SyncEvent::CountdownExpired { player_id } => break player_id,
                _ => continue,
            }
        };
        assert_eq!(expired, fx.player);
        let view = handle.view();
        assert!(view.snapshot.is_active);
        assert_eq!(view.snapshot.countdown, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_auto_resolve_sells_to_leader() {
        let fx = fixture();
        let config = SyncConfig {
            countdown_expiry: CountdownExpiry::AutoResolve,
            ..SyncConfig::default()
        };
        let (handle, _task) = start(&fx, config).await;
        handle.start_auction(fx.player, None).await.unwrap();
        handle.place_bid(fx.team_a, "Team A", 80).await.unwrap();
        handle.set_countdown(Some(1)).await.unwrap();

        wait_for_view(&handle, |v| !v.snapshot.is_active).await;
        let view = handle.view();
        let team_a = view.teams.iter().find(|t| t.id == fx.team_a).unwrap();
        assert_eq!(team_a.remaining_budget, 420);
        assert_eq!(team_a.players.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_auto_resolve_without_bids_is_unsold() {
        let fx = fixture();
        let config = SyncConfig {
            countdown_expiry: CountdownExpiry::AutoResolve,
            ..SyncConfig::default()
        };
        let (handle, _task) = start(&fx, config).await;
        handle.start_auction(fx.player, None).await.unwrap();
        handle.set_countdown(Some(1)).await.unwrap();

        wait_for_view(&handle, |v| !v.snapshot.is_active).await;
        let view = handle.view();
        let player = view.players.iter().find(|p| p.id == fx.player).unwrap();
        assert_eq!(player.status, crate::auction::PlayerStatus::Unsold);
    }

    #[tokio::test(start_paused = true)]
    async fn admin_changes_reach_the_view() {
        let fx = fixture();
        let (handle, _task) = start(&fx, SyncConfig::default()).await;

        let team = handle
            .create_team(NewTeam {
                name: "Team C".into(),
                sport: Sport::Football,
                max_budget: 300,
            })
            .await
            .unwrap();
        assert!(handle.view().teams.iter().any(|t| t.id == team.id));

        handle.start_auction(fx.player, None).await.unwrap();
        let err = handle.delete_player(fx.player).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Auction(AuctionError::InvalidTransition(_))
        ));

        handle.delete_team(team.id).await.unwrap();
        assert!(!handle.view().teams.iter().any(|t| t.id == team.id));
        assert_eq!(fx.store.db.load_teams().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn handle_reports_closed_after_shutdown() {
        let fx = fixture();
        let (handle, task) = start(&fx, SyncConfig::default()).await;
        handle.shutdown().await;
        task.await.unwrap();

        assert!(matches!(
            handle.start_auction(fx.player, None).await,
            Err(SyncError::Closed)
        ));
    }
}
