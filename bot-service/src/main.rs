// Copyright (C) 2026 Gangle
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path as FsPath, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use gangle_common::{
    DEFAULT_MAX_PLAYERS_PER_ROUND, DEFAULT_MAX_WAIT_SECONDS, DEFAULT_MIN_WAIT_SECONDS,
    DEFAULT_POINTS_MAX, GameError, GroupId, GroupLeaderboard, MessageId, Participant, PlayerId,
    PlayerStats, Round, RoundResults, RoundStatus, ScoredGuess, StorageError, circular_error,
    score_points,
};
use rand::Rng;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{MissedTickBehavior, interval};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

const CALLBACK_GUESS: &str = "guess";
const CALLBACK_CANCEL: &str = "cancel";

struct BotConfig {
    telegram_bot_token: Option<String>,
    data_dir: PathBuf,
    max_players_per_round: usize,
    points_max: u32,
    min_wait_seconds: i64,
    max_wait_seconds: i64,
    sweep_interval: Duration,
    poll_timeout_seconds: u64,
}

impl BotConfig {
    fn from_env() -> Self {
        Self {
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            data_dir: PathBuf::from(
                std::env::var("DATA_DIR")
                    .ok()
                    .unwrap_or_else(|| "./data".to_string()),
            ),
            max_players_per_round: std::env::var("MAX_PLAYERS_PER_ROUND")
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(DEFAULT_MAX_PLAYERS_PER_ROUND)
                .max(1),
            points_max: std::env::var("POINTS_MAX")
                .ok()
                .and_then(|value| value.parse::<u32>().ok())
                .unwrap_or(DEFAULT_POINTS_MAX),
            min_wait_seconds: std::env::var("MIN_WAIT_TIME")
                .ok()
                .and_then(|value| value.parse::<i64>().ok())
                .unwrap_or(DEFAULT_MIN_WAIT_SECONDS)
                .max(0),
            max_wait_seconds: std::env::var("MAX_WAIT_TIME")
                .ok()
                .and_then(|value| value.parse::<i64>().ok())
                .unwrap_or(DEFAULT_MAX_WAIT_SECONDS)
                .max(1),
            sweep_interval: Duration::from_secs(
                std::env::var("SWEEP_INTERVAL_SECONDS")
                    .ok()
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(5)
                    .max(1),
            ),
            poll_timeout_seconds: std::env::var("POLL_TIMEOUT_SECONDS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(30),
        }
    }
}

/// JSON file storage: one record per group for the active round and
/// one per group for the leaderboard. Writes go to a temp file in the
/// same directory and are renamed into place, so a crash mid-write
/// never leaves a half-written record visible to a later load.
struct FileStorage {
    games_dir: PathBuf,
    leaderboards_dir: PathBuf,
}

impl FileStorage {
    async fn open(data_dir: &FsPath) -> Result<Self, StorageError> {
        let games_dir = data_dir.join("games");
        let leaderboards_dir = data_dir.join("leaderboards");
        tokio::fs::create_dir_all(&games_dir).await?;
        tokio::fs::create_dir_all(&leaderboards_dir).await?;
        Ok(Self {
            games_dir,
            leaderboards_dir,
        })
    }

    fn round_path(&self, group_id: GroupId) -> PathBuf {
        self.games_dir.join(format!("game_{group_id}.json"))
    }

    fn leaderboard_path(&self, group_id: GroupId) -> PathBuf {
        self.leaderboards_dir.join(format!("group_{group_id}.json"))
    }

    async fn load_json<T: DeserializeOwned>(path: &FsPath) -> Result<Option<T>, StorageError> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StorageError::Corrupt {
                    path: path.display().to_string(),
                    source,
                }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_json<T: Serialize>(path: &FsPath, value: &T) -> Result<(), StorageError> {
        let encoded =
            serde_json::to_vec_pretty(value).map_err(|source| StorageError::Encode {
                path: path.display().to_string(),
                source,
            })?;
        let tmp_path = path.with_extension(format!("json.tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp_path, &encoded).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    async fn load_round(&self, group_id: GroupId) -> Result<Option<Round>, StorageError> {
        Self::load_json(&self.round_path(group_id)).await
    }

    async fn save_round(&self, round: &Round) -> Result<(), StorageError> {
        Self::save_json(&self.round_path(round.group_id), round).await
    }

    async fn delete_round(&self, group_id: GroupId) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.round_path(group_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn load_leaderboard(&self, group_id: GroupId) -> Result<GroupLeaderboard, StorageError> {
        Ok(Self::load_json(&self.leaderboard_path(group_id))
            .await?
            .unwrap_or_default())
    }

    async fn save_leaderboard(
        &self,
        group_id: GroupId,
        board: &GroupLeaderboard,
    ) -> Result<(), StorageError> {
        Self::save_json(&self.leaderboard_path(group_id), board).await
    }

    /// Copies the current leaderboard record to a timestamped backup.
    /// Returns `None` when there is nothing to back up.
    async fn backup_leaderboard(
        &self,
        group_id: GroupId,
        now: DateTime<Utc>,
    ) -> Result<Option<PathBuf>, StorageError> {
        let path = self.leaderboard_path(group_id);
        let backup_path = self
            .leaderboards_dir
            .join(format!("group_{group_id}.json.backup_{}", now.timestamp()));
        match tokio::fs::copy(&path, &backup_path).await {
            Ok(_) => Ok(Some(backup_path)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_leaderboard(&self, group_id: GroupId) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.leaderboard_path(group_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Group ids with an active-round record on disk, for the sweeper.
    async fn active_group_ids(&self) -> Result<Vec<GroupId>, StorageError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.games_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(raw) = name
                .strip_prefix("game_")
                .and_then(|rest| rest.strip_suffix(".json"))
                && let Ok(id) = raw.parse::<GroupId>()
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

/// One exclusive scope per group. Every read-modify-write on a
/// group's round or leaderboard runs under this lock; it is never
/// held across messaging sends or image rendering.
struct GroupLocks {
    locks: Mutex<HashMap<GroupId, Arc<Mutex<()>>>>,
}

impl GroupLocks {
    fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, group_id: GroupId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(group_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Scoring and ranking over persisted player statistics.
struct Leaderboard {
    storage: Arc<FileStorage>,
}

impl Leaderboard {
    fn new(storage: Arc<FileStorage>) -> Self {
        Self { storage }
    }

    /// Upserts one completed round's scores. `round_started_at`
    /// identifies the round; a record already stamped with it is a
    /// completion retry and the upsert is skipped, so scores apply
    /// exactly once even if the round-file delete failed after the
    /// stats were written.
    async fn record_results(
        &self,
        group_id: GroupId,
        round_started_at: DateTime<Utc>,
        scores: &[ScoredGuess],
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut board = self.storage.load_leaderboard(group_id).await?;
        if board.last_scored_round == Some(round_started_at) {
            warn!(group_id, "round scores already recorded, skipping upsert");
            return Ok(());
        }
        for score in scores {
            let entry = board.players.entry(score.player_id).or_insert_with(|| {
                PlayerStats::new(score.player_id, score.display_name.clone(), now)
            });
            entry.display_name = score.display_name.clone();
            entry.total_points += u64::from(score.points);
            entry.rounds_played += 1;
            entry.best_guess_error = entry.best_guess_error.min(score.error);
            entry.last_played_at = Some(now);
        }
        board.last_scored_round = Some(round_started_at);
        self.storage.save_leaderboard(group_id, &board).await
    }

    /// Ranking sorted by total points descending, ties broken by
    /// lower best error, then by earliest-registered player. Empty
    /// when no stats exist.
    async fn ranking(&self, group_id: GroupId) -> Result<Vec<PlayerStats>, StorageError> {
        let board = self.storage.load_leaderboard(group_id).await?;
        let mut players: Vec<PlayerStats> = board.players.into_values().collect();
        players.sort_by(|a, b| {
            b.total_points
                .cmp(&a.total_points)
                .then(a.best_guess_error.cmp(&b.best_guess_error))
                .then(a.first_seen_at.cmp(&b.first_seen_at))
                .then(a.player_id.cmp(&b.player_id))
        });
        Ok(players)
    }

    /// Backup-then-clear. If the backup write fails the stats stay
    /// untouched.
    async fn reset(
        &self,
        group_id: GroupId,
        now: DateTime<Utc>,
    ) -> Result<Option<PathBuf>, StorageError> {
        let backup = self.storage.backup_leaderboard(group_id, now).await?;
        self.storage.delete_leaderboard(group_id).await?;
        Ok(backup)
    }
}

#[derive(Debug)]
struct GuessOutcome {
    completed: Option<RoundResults>,
}

#[derive(Debug)]
struct ForfeitOutcome {
    display_name: String,
    completed: Option<RoundResults>,
}

#[derive(Debug, Clone, Serialize)]
struct RoundSummary {
    joined: usize,
    submitted: usize,
    forfeited: usize,
    pending: usize,
    elapsed_seconds: i64,
    completes_in_seconds: i64,
}

/// Owns the life-cycle of the single active round per group: join,
/// guess submission, forfeit, completion, timeout. Every operation
/// serializes on the per-group lock.
struct RoundManager {
    storage: Arc<FileStorage>,
    leaderboard: Arc<Leaderboard>,
    locks: GroupLocks,
    max_players_per_round: usize,
    points_max: u32,
    min_wait_seconds: i64,
    max_wait_seconds: i64,
}

impl RoundManager {
    fn new(storage: Arc<FileStorage>, leaderboard: Arc<Leaderboard>, config: &BotConfig) -> Self {
        Self {
            storage,
            leaderboard,
            locks: GroupLocks::new(),
            max_players_per_round: config.max_players_per_round,
            points_max: config.points_max,
            min_wait_seconds: config.min_wait_seconds,
            max_wait_seconds: config.max_wait_seconds,
        }
    }

    /// Loads the group's active round. A corrupt record is logged and
    /// treated as "no active round" so a bad file can never wedge the
    /// group.
    async fn load_waiting_round(&self, group_id: GroupId) -> Result<Option<Round>, GameError> {
        match self.storage.load_round(group_id).await {
            Ok(Some(round)) if round.status == RoundStatus::WaitingForGuesses => Ok(Some(round)),
            Ok(_) => Ok(None),
            Err(err @ StorageError::Corrupt { .. }) => {
                warn!(group_id, error = %err, "ignoring corrupt active round record");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn start_round(
        &self,
        group_id: GroupId,
        started_by: Option<PlayerId>,
        now: DateTime<Utc>,
    ) -> Result<Round, GameError> {
        let _guard = self.locks.acquire(group_id).await;
        if self.load_waiting_round(group_id).await?.is_some() {
            return Err(GameError::RoundAlreadyActive);
        }
        let target_angle: u16 = rand::rng().random_range(0..=359);
        let round = Round::new(group_id, target_angle, started_by, now);
        self.storage.save_round(&round).await?;
        info!(group_id, target_angle, "started new round");
        Ok(round)
    }

    /// Adds the player to the round (or refreshes their display name)
    /// and returns the current round for the caller to inspect.
    async fn join_round(
        &self,
        group_id: GroupId,
        player_id: PlayerId,
        display_name: &str,
    ) -> Result<Round, GameError> {
        let _guard = self.locks.acquire(group_id).await;
        let mut round = self
            .load_waiting_round(group_id)
            .await?
            .ok_or(GameError::NoActiveRound)?;
        self.join_locked(&mut round, player_id, display_name)?;
        self.storage.save_round(&round).await?;
        info!(group_id, player_id, "player joined round");
        Ok(round)
    }

    fn join_locked(
        &self,
        round: &mut Round,
        player_id: PlayerId,
        display_name: &str,
    ) -> Result<(), GameError> {
        if let Some(existing) = round.participant_mut(player_id) {
            existing.display_name = display_name.to_string();
            return Ok(());
        }
        if round.participants.len() >= self.max_players_per_round {
            return Err(GameError::RoundFull);
        }
        round
            .participants
            .push(Participant::new(player_id, display_name));
        Ok(())
    }

    /// Records a guess (joining implicitly if needed), then runs the
    /// completion check. The round completes only when every
    /// non-forfeited participant has guessed and the minimum wait has
    /// elapsed, so late joiners get a window even after everyone
    /// guessed.
    async fn submit_guess(
        &self,
        group_id: GroupId,
        player_id: PlayerId,
        display_name: &str,
        guess: i64,
        now: DateTime<Utc>,
    ) -> Result<GuessOutcome, GameError> {
        let _guard = self.locks.acquire(group_id).await;
        let mut round = self
            .load_waiting_round(group_id)
            .await?
            .ok_or(GameError::NoActiveRound)?;
        // Capacity is checked before guess validity; the join is not
        // committed unless the guess passes, since nothing is saved on
        // the error paths below.
        self.join_locked(&mut round, player_id, display_name)?;
        if !(0..=359).contains(&guess) {
            return Err(GameError::InvalidGuess);
        }
        let participant = round
            .participant_mut(player_id)
            .ok_or(GameError::PlayerNotInRound)?;
        if participant.forfeited {
            return Err(GameError::PlayerNotInRound);
        }
        if participant.guess.is_some() {
            return Err(GameError::AlreadySubmitted);
        }
        participant.guess = Some(guess as u16);
        participant.submitted_at = Some(now);
        self.storage.save_round(&round).await?;
        info!(group_id, player_id, "guess recorded");
        let completed = self.try_complete(round, now, false).await?;
        Ok(GuessOutcome { completed })
    }

    /// Admin-only removal of a participant from scoring and from the
    /// pending set. If that leaves the round fully submitted, it
    /// completes immediately (subject to the minimum wait).
    async fn forfeit(
        &self,
        group_id: GroupId,
        actor_is_admin: bool,
        target_player_id: PlayerId,
        now: DateTime<Utc>,
    ) -> Result<ForfeitOutcome, GameError> {
        if !actor_is_admin {
            return Err(GameError::NotAuthorized);
        }
        let _guard = self.locks.acquire(group_id).await;
        let mut round = self
            .load_waiting_round(group_id)
            .await?
            .ok_or(GameError::NoActiveRound)?;
        let participant = round
            .participant_mut(target_player_id)
            .ok_or(GameError::PlayerNotInRound)?;
        participant.forfeited = true;
        let display_name = participant.display_name.clone();
        self.storage.save_round(&round).await?;
        info!(group_id, target_player_id, "player forfeited");
        let completed = self.try_complete(round, now, false).await?;
        Ok(ForfeitOutcome {
            display_name,
            completed,
        })
    }

    /// Idempotent timing check: force-completes once the maximum wait
    /// is exceeded (missing guesses score nothing), or once everyone
    /// submitted and the minimum wait elapsed. No-op for a group with
    /// no waiting round, so repeated and concurrent invocations are
    /// safe.
    async fn evaluate_timeout(
        &self,
        group_id: GroupId,
        now: DateTime<Utc>,
    ) -> Result<Option<RoundResults>, GameError> {
        let _guard = self.locks.acquire(group_id).await;
        let Some(round) = self.load_waiting_round(group_id).await? else {
            return Ok(None);
        };
        self.try_complete(round, now, false).await
    }

    /// Early completion with scoring, allowed for an admin or the
    /// player who started the round.
    async fn end_round(
        &self,
        group_id: GroupId,
        actor: PlayerId,
        actor_is_admin: bool,
        now: DateTime<Utc>,
    ) -> Result<RoundResults, GameError> {
        let _guard = self.locks.acquire(group_id).await;
        let round = self
            .load_waiting_round(group_id)
            .await?
            .ok_or(GameError::NoActiveRound)?;
        if !actor_is_admin && round.started_by != Some(actor) {
            return Err(GameError::NotAuthorized);
        }
        info!(group_id, actor, "round ended early");
        self.complete_locked(round, now).await
    }

    /// Admin cancellation: the round is discarded without scoring.
    async fn cancel_round(
        &self,
        group_id: GroupId,
        actor_is_admin: bool,
    ) -> Result<Round, GameError> {
        if !actor_is_admin {
            return Err(GameError::NotAuthorized);
        }
        let _guard = self.locks.acquire(group_id).await;
        let mut round = self
            .load_waiting_round(group_id)
            .await?
            .ok_or(GameError::NoActiveRound)?;
        round.status = RoundStatus::Cancelled;
        self.storage.delete_round(group_id).await?;
        info!(group_id, "round cancelled without scoring");
        Ok(round)
    }

    async fn round_status(
        &self,
        group_id: GroupId,
        now: DateTime<Utc>,
    ) -> Result<Option<RoundSummary>, GameError> {
        let _guard = self.locks.acquire(group_id).await;
        let Some(round) = self.load_waiting_round(group_id).await? else {
            return Ok(None);
        };
        let elapsed = round.elapsed_seconds(now).max(0);
        Ok(Some(RoundSummary {
            joined: round.participants.len(),
            submitted: round.submitted_count(),
            forfeited: round.forfeited_count(),
            pending: round.pending_count(),
            elapsed_seconds: elapsed,
            completes_in_seconds: (self.min_wait_seconds - elapsed).max(0),
        }))
    }

    /// Looks up a current participant by display name, for the
    /// `/forfeit <name>` command.
    async fn find_participant(
        &self,
        group_id: GroupId,
        display_name: &str,
    ) -> Result<Option<PlayerId>, GameError> {
        let _guard = self.locks.acquire(group_id).await;
        let Some(round) = self.load_waiting_round(group_id).await? else {
            return Ok(None);
        };
        Ok(round
            .participants
            .iter()
            .find(|p| p.display_name.eq_ignore_ascii_case(display_name))
            .map(|p| p.player_id))
    }

    /// Backup-then-clear of the group's leaderboard, serialized with
    /// round completion so the two never interleave.
    async fn reset_leaderboard(
        &self,
        group_id: GroupId,
        actor_is_admin: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<PathBuf>, GameError> {
        if !actor_is_admin {
            return Err(GameError::NotAuthorized);
        }
        let _guard = self.locks.acquire(group_id).await;
        let backup = self.leaderboard.reset(group_id, now).await?;
        info!(group_id, backup = ?backup, "leaderboard reset");
        Ok(backup)
    }

    async fn active_group_ids(&self) -> Result<Vec<GroupId>, StorageError> {
        self.storage.active_group_ids().await
    }

    /// Caller holds the group lock. `force` skips the timing policy
    /// (used by explicit early ending).
    async fn try_complete(
        &self,
        round: Round,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<Option<RoundResults>, GameError> {
        if round.status != RoundStatus::WaitingForGuesses {
            return Ok(None);
        }
        if !force {
            let elapsed = round.elapsed_seconds(now);
            let timed_out = elapsed >= self.max_wait_seconds;
            let settled = round.all_submitted() && elapsed >= self.min_wait_seconds;
            if !timed_out && !settled {
                return Ok(None);
            }
        }
        self.complete_locked(round, now).await.map(Some)
    }

    /// The single transition into COMPLETED. The leaderboard is
    /// persisted before the active-round record is removed; if either
    /// write fails the round stays WAITING and the next sweep retries
    /// the transition. The retry cannot double-score: the leaderboard
    /// record is stamped with the round it last applied.
    async fn complete_locked(
        &self,
        mut round: Round,
        now: DateTime<Utc>,
    ) -> Result<RoundResults, GameError> {
        let mut scores: Vec<ScoredGuess> = round
            .participants
            .iter()
            .filter(|p| p.is_scorable())
            .map(|p| {
                let guess = p.guess.unwrap_or_default();
                let err = circular_error(guess, round.target_angle);
                ScoredGuess {
                    player_id: p.player_id,
                    display_name: p.display_name.clone(),
                    guess,
                    error: err,
                    points: score_points(self.points_max, err),
                }
            })
            .collect();
        scores.sort_by(|a, b| b.points.cmp(&a.points).then(a.error.cmp(&b.error)));

        self.leaderboard
            .record_results(round.group_id, round.started_at, &scores, now)
            .await?;
        round.status = RoundStatus::Completed;
        self.storage.delete_round(round.group_id).await?;
        info!(
            group_id = round.group_id,
            target_angle = round.target_angle,
            players_scored = scores.len(),
            "round completed"
        );
        let players_scored = scores.len();
        Ok(RoundResults {
            group_id: round.group_id,
            target_angle: round.target_angle,
            scores,
            total_players: round.participants.len(),
            players_scored,
            started_at: round.started_at,
            completed_at: now,
        })
    }
}

#[derive(Debug, Clone)]
struct ImageArtifact {
    bytes: Vec<u8>,
    file_name: String,
    mime_type: String,
}

/// Synchronous, CPU-bound angle rendering. Always invoked through
/// `spawn_blocking` so a slow render cannot stall other groups.
trait AngleRenderer: Send + Sync {
    fn render_angle(&self, angle: u16, show_label: bool) -> Result<ImageArtifact, GameError>;
}

/// Built-in renderer: circle outline, two rays with a randomly
/// oriented base, and an arc spanning the true angle (reflex angles
/// included). The label is drawn only for the reveal image.
struct SvgAngleRenderer;

impl AngleRenderer for SvgAngleRenderer {
    fn render_angle(&self, angle: u16, show_label: bool) -> Result<ImageArtifact, GameError> {
        let base: u16 = rand::rng().random_range(0..=359);
        Ok(render_angle_svg(angle, base, show_label))
    }
}

fn svg_point(center: f64, radius: f64, radians: f64) -> (f64, f64) {
    // SVG's y axis points down; negate sin so angles run
    // counter-clockwise like on paper.
    (
        center + radius * radians.cos(),
        center - radius * radians.sin(),
    )
}

fn render_angle_svg(angle: u16, base: u16, show_label: bool) -> ImageArtifact {
    let size = 400.0_f64;
    let center = size / 2.0;
    let ray = 160.0_f64;
    let arc_radius = 56.0_f64;

    let start = f64::from(base).to_radians();
    let end = f64::from(u32::from(base) + u32::from(angle)).to_radians();

    let (x1, y1) = svg_point(center, ray, start);
    let (x2, y2) = svg_point(center, ray, end);
    let (ax1, ay1) = svg_point(center, arc_radius, start);
    let (ax2, ay2) = svg_point(center, arc_radius, end);
    let large_arc = if angle > 180 { 1 } else { 0 };

    let mut svg = format!(
        concat!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{s}" height="{s}" viewBox="0 0 {s} {s}">"#,
            r#"<circle cx="{c}" cy="{c}" r="{ray}" fill="none" stroke="gray" stroke-dasharray="6 6" opacity="0.4"/>"#,
            r#"<line x1="{c}" y1="{c}" x2="{x1:.2}" y2="{y1:.2}" stroke="black" stroke-width="3"/>"#,
            r#"<line x1="{c}" y1="{c}" x2="{x2:.2}" y2="{y2:.2}" stroke="black" stroke-width="3"/>"#,
            r#"<path d="M {ax1:.2} {ay1:.2} A {r} {r} 0 {large} 0 {ax2:.2} {ay2:.2}" fill="none" stroke="red" stroke-width="3"/>"#,
        ),
        s = size,
        c = center,
        ray = ray,
        x1 = x1,
        y1 = y1,
        x2 = x2,
        y2 = y2,
        ax1 = ax1,
        ay1 = ay1,
        ax2 = ax2,
        ay2 = ay2,
        r = arc_radius,
        large = large_arc,
    );
    if show_label {
        let mid = (start + end) / 2.0;
        let (lx, ly) = svg_point(center, arc_radius + 34.0, mid);
        svg.push_str(&format!(
            r#"<text x="{lx:.2}" y="{ly:.2}" text-anchor="middle" fill="red" font-size="22" font-weight="bold">{angle}°</text>"#
        ));
    }
    svg.push_str("</svg>");

    ImageArtifact {
        bytes: svg.into_bytes(),
        file_name: if show_label {
            "reveal.svg".to_string()
        } else {
            "angle.svg".to_string()
        },
        mime_type: "image/svg+xml".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InlineButton {
    text: String,
    callback_data: String,
}

impl InlineButton {
    fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

type Keyboard = Vec<Vec<InlineButton>>;

/// Identity attached by the gateway to every inbound event. Admin
/// status is resolved by the messaging platform; the core never
/// re-derives it.
#[derive(Debug, Clone)]
struct Sender {
    player_id: PlayerId,
    display_name: String,
    is_admin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChatKind {
    Private,
    Group,
}

#[derive(Debug, Clone)]
enum InboundEvent {
    Command {
        group_id: GroupId,
        chat_kind: ChatKind,
        sender: Sender,
        name: String,
        args: Vec<String>,
    },
    Callback {
        callback_id: String,
        group_id: GroupId,
        sender: Sender,
        data: String,
    },
}

/// The core's only view of the chat platform: an event source plus
/// send/edit primitives. The wire protocol lives entirely behind this
/// seam.
#[async_trait]
trait MessagingGateway: Send + Sync {
    async fn poll_events(&self) -> anyhow::Result<Vec<InboundEvent>>;
    async fn send_message(
        &self,
        group_id: GroupId,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> anyhow::Result<MessageId>;
    async fn edit_message(
        &self,
        group_id: GroupId,
        message_id: MessageId,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> anyhow::Result<()>;
    async fn delete_message(&self, group_id: GroupId, message_id: MessageId) -> anyhow::Result<()>;
    async fn send_photo(
        &self,
        group_id: GroupId,
        image: &ImageArtifact,
        caption: &str,
        keyboard: Option<Keyboard>,
    ) -> anyhow::Result<MessageId>;
    async fn answer_callback(
        &self,
        callback_id: &str,
        text: &str,
        show_alert: bool,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    // No `default` attr here: it would impose a `T: Default` bound the
    // call sites cannot meet, and a missing field is `None` anyway.
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    chat: TgChat,
    #[serde(default)]
    from: Option<TgUser>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgCallbackQuery {
    id: String,
    from: TgUser,
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChatMember {
    status: String,
}

fn tg_display_name(user: &TgUser) -> String {
    user.first_name
        .clone()
        .or_else(|| user.username.clone())
        .unwrap_or_else(|| format!("player_{}", user.id))
}

/// Splits `/command@BotName arg1 arg2` into a command name and args.
fn parse_command(text: &str) -> Option<(String, Vec<String>)> {
    let text = text.trim();
    let rest = text.strip_prefix('/')?;
    let mut parts = rest.split_whitespace();
    let raw_name = parts.next()?;
    let name = raw_name.split('@').next().unwrap_or(raw_name);
    if name.is_empty() {
        return None;
    }
    Some((
        name.to_string(),
        parts.map(ToOwned::to_owned).collect::<Vec<String>>(),
    ))
}

/// Telegram Bot API implementation of the gateway, long-polling
/// `getUpdates` for inbound events.
struct TelegramGateway {
    client: reqwest::Client,
    base_url: String,
    poll_timeout_seconds: u64,
    offset: Mutex<i64>,
}

impl TelegramGateway {
    fn new(token: &str, poll_timeout_seconds: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("https://api.telegram.org/bot{token}"),
            poll_timeout_seconds,
            offset: Mutex::new(0),
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<T> {
        let response = self
            .client
            .post(self.endpoint(method))
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("failed to call telegram {method}"))?;
        let envelope: TgResponse<T> = response
            .json()
            .await
            .with_context(|| format!("invalid telegram {method} response"))?;
        if !envelope.ok {
            anyhow::bail!(
                "telegram {method} failed: {}",
                envelope.description.unwrap_or_default()
            );
        }
        envelope
            .result
            .ok_or_else(|| anyhow::anyhow!("telegram {method} returned no result"))
    }

    async fn resolve_admin(&self, chat_id: i64, user_id: i64) -> bool {
        let payload = serde_json::json!({ "chat_id": chat_id, "user_id": user_id });
        match self.call::<TgChatMember>("getChatMember", payload).await {
            Ok(member) => matches!(member.status.as_str(), "administrator" | "creator"),
            Err(err) => {
                warn!(chat_id, user_id, error = %err, "failed to resolve admin status");
                false
            }
        }
    }

    fn keyboard_json(keyboard: &Keyboard) -> serde_json::Value {
        serde_json::json!({
            "inline_keyboard": keyboard
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|button| {
                            serde_json::json!({
                                "text": button.text,
                                "callback_data": button.callback_data,
                            })
                        })
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        })
    }

    async fn update_to_event(&self, update: TgUpdate) -> Option<InboundEvent> {
        if let Some(message) = update.message {
            let from = message.from?;
            let text = message.text?;
            let (name, args) = parse_command(&text)?;
            let chat_kind = if message.chat.kind == "private" {
                ChatKind::Private
            } else {
                ChatKind::Group
            };
            let is_admin = match chat_kind {
                ChatKind::Group => self.resolve_admin(message.chat.id, from.id).await,
                ChatKind::Private => false,
            };
            return Some(InboundEvent::Command {
                group_id: message.chat.id,
                chat_kind,
                sender: Sender {
                    player_id: from.id,
                    display_name: tg_display_name(&from),
                    is_admin,
                },
                name,
                args,
            });
        }

        if let Some(callback) = update.callback_query {
            let message = callback.message?;
            let data = callback.data?;
            let is_admin = self.resolve_admin(message.chat.id, callback.from.id).await;
            return Some(InboundEvent::Callback {
                callback_id: callback.id,
                group_id: message.chat.id,
                sender: Sender {
                    player_id: callback.from.id,
                    display_name: tg_display_name(&callback.from),
                    is_admin,
                },
                data,
            });
        }

        None
    }
}

#[async_trait]
impl MessagingGateway for TelegramGateway {
    async fn poll_events(&self) -> anyhow::Result<Vec<InboundEvent>> {
        let offset = { *self.offset.lock().await };
        let payload = serde_json::json!({
            "offset": offset,
            "timeout": self.poll_timeout_seconds,
            "allowed_updates": ["message", "callback_query"],
        });
        let updates: Vec<TgUpdate> = self.call("getUpdates", payload).await?;

        let mut next_offset = offset;
        let mut events = Vec::new();
        for update in updates {
            next_offset = next_offset.max(update.update_id + 1);
            if let Some(event) = self.update_to_event(update).await {
                events.push(event);
            }
        }
        *self.offset.lock().await = next_offset;
        Ok(events)
    }

    async fn send_message(
        &self,
        group_id: GroupId,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> anyhow::Result<MessageId> {
        let mut payload = serde_json::json!({ "chat_id": group_id, "text": text });
        if let Some(keyboard) = keyboard {
            payload["reply_markup"] = Self::keyboard_json(&keyboard);
        }
        let message: TgMessage = self.call("sendMessage", payload).await?;
        Ok(message.message_id)
    }

    async fn edit_message(
        &self,
        group_id: GroupId,
        message_id: MessageId,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> anyhow::Result<()> {
        let mut payload = serde_json::json!({
            "chat_id": group_id,
            "message_id": message_id,
            "text": text,
        });
        if let Some(keyboard) = keyboard {
            payload["reply_markup"] = Self::keyboard_json(&keyboard);
        }
        self.call::<serde_json::Value>("editMessageText", payload)
            .await?;
        Ok(())
    }

    async fn delete_message(&self, group_id: GroupId, message_id: MessageId) -> anyhow::Result<()> {
        let payload = serde_json::json!({ "chat_id": group_id, "message_id": message_id });
        self.call::<serde_json::Value>("deleteMessage", payload)
            .await?;
        Ok(())
    }

    async fn send_photo(
        &self,
        group_id: GroupId,
        image: &ImageArtifact,
        caption: &str,
        keyboard: Option<Keyboard>,
    ) -> anyhow::Result<MessageId> {
        let part = reqwest::multipart::Part::bytes(image.bytes.clone())
            .file_name(image.file_name.clone())
            .mime_str(&image.mime_type)
            .context("invalid image mime type")?;
        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", group_id.to_string())
            .text("caption", caption.to_string())
            .part("photo", part);
        if let Some(keyboard) = keyboard {
            form = form.text("reply_markup", Self::keyboard_json(&keyboard).to_string());
        }
        let response = self
            .client
            .post(self.endpoint("sendPhoto"))
            .multipart(form)
            .send()
            .await
            .context("failed to call telegram sendPhoto")?;
        let envelope: TgResponse<TgMessage> = response
            .json()
            .await
            .context("invalid telegram sendPhoto response")?;
        if !envelope.ok {
            anyhow::bail!(
                "telegram sendPhoto failed: {}",
                envelope.description.unwrap_or_default()
            );
        }
        let message = envelope
            .result
            .ok_or_else(|| anyhow::anyhow!("telegram sendPhoto returned no result"))?;
        Ok(message.message_id)
    }

    async fn answer_callback(
        &self,
        callback_id: &str,
        text: &str,
        show_alert: bool,
    ) -> anyhow::Result<()> {
        let payload = serde_json::json!({
            "callback_query_id": callback_id,
            "text": text,
            "show_alert": show_alert,
        });
        self.call::<serde_json::Value>("answerCallbackQuery", payload)
            .await?;
        Ok(())
    }
}

/// In-flight digit-picker state for one player in one group. Guesses
/// are entered hundreds-tens-units through inline buttons.
#[derive(Debug, Clone, Default)]
struct GuessDraft {
    digits: [Option<u8>; 3],
    picker_message_id: Option<MessageId>,
}

impl GuessDraft {
    fn value(&self) -> Option<i64> {
        let [h, t, u] = self.digits;
        Some(i64::from(h?) * 100 + i64::from(t?) * 10 + i64::from(u?))
    }
}

/// Digit cap per picker step so the assembled value stays in 0..=359:
/// hundreds 0-3, tens 0-5 once the hundreds digit is 3, units 0-9.
fn picker_max_digit(step: usize, hundreds: Option<u8>) -> u8 {
    match step {
        0 => 3,
        1 if hundreds == Some(3) => 5,
        _ => 9,
    }
}

fn picker_keyboard(step: usize, max_digit: u8) -> Keyboard {
    let mut keyboard = Vec::new();
    let mut row = Vec::new();
    for digit in 0..=max_digit.min(9) {
        row.push(InlineButton::new(
            digit.to_string(),
            format!("pick:{step}:{digit}"),
        ));
        if row.len() == 5 {
            keyboard.push(std::mem::take(&mut row));
        }
    }
    if !row.is_empty() {
        keyboard.push(row);
    }
    keyboard.push(vec![InlineButton::new("❌ Cancel", CALLBACK_CANCEL)]);
    keyboard
}

fn confirm_keyboard(value: i64) -> Keyboard {
    vec![
        vec![InlineButton::new("✅ Confirm", format!("confirm:{value}"))],
        vec![InlineButton::new("🔄 Start Over", CALLBACK_GUESS)],
        vec![InlineButton::new("❌ Cancel", CALLBACK_CANCEL)],
    ]
}

const HELP_TEXT: &str = "🎯 Gangle — Guess the Angle Game\n\n\
How to play:\n\
1. /start_round in a group begins a new round\n\
2. Tap the Guess button on the angle image\n\
3. Pick your angle with the digit buttons (0-359°)\n\
4. Confirm — your guess stays hidden until the round ends\n\n\
Commands:\n\
/start_round — start a new round\n\
/status — current round progress\n\
/leaderboard — view rankings\n\
/help — this message\n\n\
Admin commands:\n\
/forfeit <name> — remove a player from the round\n\
/end_round — end the round early with scoring (admin or starter)\n\
/cancel_round — discard the round without scoring\n\
/reset_leaderboard — clear all scores (a backup is kept)\n\n\
Scoring: 100 points for a perfect guess, falling linearly to 0 at 180° off.";

const WELCOME_TEXT: &str = "👋 Welcome to Gangle — Guess the Angle!\n\n\
🎯 I'm a group game bot. Add me to a group chat and use /start_round to begin.\n\
📝 Use /help to see all commands.";

/// Wires the round manager, leaderboard, storage, renderer, and
/// messaging gateway together and exposes the command surface.
#[derive(Clone)]
struct BotApp {
    manager: Arc<RoundManager>,
    leaderboard: Arc<Leaderboard>,
    gateway: Arc<dyn MessagingGateway>,
    renderer: Arc<dyn AngleRenderer>,
    guess_drafts: Arc<Mutex<HashMap<(GroupId, PlayerId), GuessDraft>>>,
}

impl BotApp {
    async fn handle_event(&self, event: InboundEvent) {
        let now = Utc::now();
        // Every inbound group event doubles as a timeout tick for that
        // group, so rounds end promptly even between sweeps.
        match &event {
            InboundEvent::Command {
                group_id,
                chat_kind: ChatKind::Group,
                ..
            }
            | InboundEvent::Callback { group_id, .. } => {
                self.sweep_group(*group_id, now).await;
            }
            InboundEvent::Command { .. } => {}
        }

        let outcome = match event {
            InboundEvent::Command {
                group_id,
                chat_kind,
                sender,
                name,
                args,
            } => {
                self.handle_command(group_id, chat_kind, sender, &name, &args)
                    .await
            }
            InboundEvent::Callback {
                callback_id,
                group_id,
                sender,
                data,
            } => {
                self.handle_callback(&callback_id, group_id, sender, &data)
                    .await
            }
        };
        if let Err(err) = outcome {
            warn!(error = %err, "event handling failed");
        }
    }

    async fn handle_command(
        &self,
        group_id: GroupId,
        chat_kind: ChatKind,
        sender: Sender,
        name: &str,
        args: &[String],
    ) -> anyhow::Result<()> {
        match name {
            "start" => self.cmd_start(group_id, chat_kind).await,
            "help" => {
                self.gateway.send_message(group_id, HELP_TEXT, None).await?;
                Ok(())
            }
            "start_round" => self.cmd_start_round(group_id, chat_kind, &sender).await,
            "status" => self.cmd_status(group_id, chat_kind).await,
            "leaderboard" => self.cmd_leaderboard(group_id, chat_kind).await,
            "forfeit" => self.cmd_forfeit(group_id, &sender, args).await,
            "end_round" => self.cmd_end_round(group_id, &sender).await,
            "cancel_round" => self.cmd_cancel_round(group_id, &sender).await,
            "reset_leaderboard" => self.cmd_reset_leaderboard(group_id, &sender).await,
            _ => Ok(()),
        }
    }

    async fn cmd_start(&self, group_id: GroupId, chat_kind: ChatKind) -> anyhow::Result<()> {
        let text = match chat_kind {
            ChatKind::Private => WELCOME_TEXT,
            ChatKind::Group => "🎯 Use /start_round to begin a new angle guessing game!",
        };
        self.gateway.send_message(group_id, text, None).await?;
        Ok(())
    }

    async fn cmd_start_round(
        &self,
        group_id: GroupId,
        chat_kind: ChatKind,
        sender: &Sender,
    ) -> anyhow::Result<()> {
        if chat_kind != ChatKind::Group {
            self.gateway
                .send_message(
                    group_id,
                    "🚫 Gangle can only be played in group chats!",
                    None,
                )
                .await?;
            return Ok(());
        }
        let round = match self
            .manager
            .start_round(group_id, Some(sender.player_id), Utc::now())
            .await
        {
            Ok(round) => round,
            Err(err) => return self.report_game_error(group_id, err).await,
        };

        match self.render_angle(round.target_angle, false).await {
            Ok(image) => {
                let keyboard = vec![vec![InlineButton::new("🎯 Guess the Angle", CALLBACK_GUESS)]];
                self.gateway
                    .send_photo(
                        group_id,
                        &image,
                        "📐 Guess the angle! (0-359 degrees)\n\nTap the button below to submit your guess privately.",
                        Some(keyboard),
                    )
                    .await?;
            }
            Err(err) => {
                error!(group_id, error = %err, "angle rendering failed, discarding round");
                if let Err(cancel_err) = self.manager.cancel_round(group_id, true).await {
                    error!(group_id, error = %cancel_err, "failed to discard round after render failure");
                }
                self.gateway
                    .send_message(group_id, "❌ Failed to start round. Please try again.", None)
                    .await?;
            }
        }
        Ok(())
    }

    async fn cmd_status(&self, group_id: GroupId, chat_kind: ChatKind) -> anyhow::Result<()> {
        if chat_kind != ChatKind::Group {
            return Ok(());
        }
        match self.manager.round_status(group_id, Utc::now()).await {
            Ok(Some(summary)) => {
                self.gateway
                    .send_message(group_id, &format_status(&summary), None)
                    .await?;
            }
            Ok(None) => {
                self.gateway
                    .send_message(group_id, GameError::NoActiveRound.user_message(), None)
                    .await?;
            }
            Err(err) => return self.report_game_error(group_id, err).await,
        }
        Ok(())
    }

    async fn cmd_leaderboard(&self, group_id: GroupId, chat_kind: ChatKind) -> anyhow::Result<()> {
        if chat_kind != ChatKind::Group {
            self.gateway
                .send_message(
                    group_id,
                    "🚫 Leaderboards are only available in group chats!",
                    None,
                )
                .await?;
            return Ok(());
        }
        match self.leaderboard.ranking(group_id).await {
            Ok(players) if players.is_empty() => {
                self.gateway
                    .send_message(
                        group_id,
                        "📊 Leaderboard is empty!\n\nStart playing rounds to see player rankings here.",
                        None,
                    )
                    .await?;
            }
            Ok(players) => {
                self.gateway
                    .send_message(group_id, &format_leaderboard(&players, 10), None)
                    .await?;
            }
            Err(err) => return self.report_game_error(group_id, err.into()).await,
        }
        Ok(())
    }

    async fn cmd_forfeit(
        &self,
        group_id: GroupId,
        sender: &Sender,
        args: &[String],
    ) -> anyhow::Result<()> {
        if !sender.is_admin {
            return self
                .report_game_error(group_id, GameError::NotAuthorized)
                .await;
        }
        let Some(raw_name) = args.first() else {
            self.gateway
                .send_message(group_id, "❓ Usage: /forfeit <name>", None)
                .await?;
            return Ok(());
        };
        let target_name = raw_name.trim_start_matches('@');
        let target = match self.manager.find_participant(group_id, target_name).await {
            Ok(Some(player_id)) => player_id,
            Ok(None) => {
                return self
                    .report_game_error(group_id, GameError::PlayerNotInRound)
                    .await;
            }
            Err(err) => return self.report_game_error(group_id, err).await,
        };
        match self
            .manager
            .forfeit(group_id, sender.is_admin, target, Utc::now())
            .await
        {
            Ok(outcome) => {
                self.gateway
                    .send_message(
                        group_id,
                        &format!(
                            "❌ {} has been forfeited from the current round.",
                            outcome.display_name
                        ),
                        None,
                    )
                    .await?;
                if let Some(results) = outcome.completed {
                    self.announce_completion(&results, "🎉 Round Complete!")
                        .await;
                }
                Ok(())
            }
            Err(err) => self.report_game_error(group_id, err).await,
        }
    }

    async fn cmd_end_round(&self, group_id: GroupId, sender: &Sender) -> anyhow::Result<()> {
        match self
            .manager
            .end_round(group_id, sender.player_id, sender.is_admin, Utc::now())
            .await
        {
            Ok(results) => {
                self.announce_completion(&results, "⏹️ Round Ended Early!")
                    .await;
                Ok(())
            }
            Err(err) => self.report_game_error(group_id, err).await,
        }
    }

    async fn cmd_cancel_round(&self, group_id: GroupId, sender: &Sender) -> anyhow::Result<()> {
        match self.manager.cancel_round(group_id, sender.is_admin).await {
            Ok(_) => {
                self.clear_group_drafts(group_id).await;
                self.gateway
                    .send_message(group_id, "⏹️ Round cancelled — no scores recorded.", None)
                    .await?;
                Ok(())
            }
            Err(err) => self.report_game_error(group_id, err).await,
        }
    }

    async fn cmd_reset_leaderboard(
        &self,
        group_id: GroupId,
        sender: &Sender,
    ) -> anyhow::Result<()> {
        match self
            .manager
            .reset_leaderboard(group_id, sender.is_admin, Utc::now())
            .await
        {
            Ok(_) => {
                self.gateway
                    .send_message(
                        group_id,
                        "🔄 Leaderboard has been reset!\n\nAll player scores have been cleared.",
                        None,
                    )
                    .await?;
                Ok(())
            }
            Err(err) => self.report_game_error(group_id, err).await,
        }
    }

    async fn handle_callback(
        &self,
        callback_id: &str,
        group_id: GroupId,
        sender: Sender,
        data: &str,
    ) -> anyhow::Result<()> {
        if data == CALLBACK_GUESS {
            self.cb_open_picker(callback_id, group_id, &sender).await
        } else if let Some(rest) = data.strip_prefix("pick:") {
            self.cb_pick(callback_id, group_id, &sender, rest).await
        } else if let Some(value) = data.strip_prefix("confirm:") {
            self.cb_confirm(callback_id, group_id, &sender, value).await
        } else if data == CALLBACK_CANCEL {
            self.cb_cancel(callback_id, group_id, &sender).await
        } else {
            self.gateway
                .answer_callback(callback_id, "Unknown action", false)
                .await
        }
    }

    async fn cb_open_picker(
        &self,
        callback_id: &str,
        group_id: GroupId,
        sender: &Sender,
    ) -> anyhow::Result<()> {
        let round = match self
            .manager
            .join_round(group_id, sender.player_id, &sender.display_name)
            .await
        {
            Ok(round) => round,
            Err(err) => return self.answer_game_error(callback_id, err).await,
        };
        if round
            .participant(sender.player_id)
            .is_some_and(|p| p.guess.is_some())
        {
            return self
                .answer_game_error(callback_id, GameError::AlreadySubmitted)
                .await;
        }

        let keyboard = picker_keyboard(0, picker_max_digit(0, None));
        let text = format!(
            "🎯 {}, select your angle guess:\n\nStep 1/3: choose the hundreds digit (0-3)\n⚠️ Only you should tap these buttons!",
            sender.display_name
        );
        let picker_message_id = self
            .gateway
            .send_message(group_id, &text, Some(keyboard))
            .await?;
        let mut drafts = self.guess_drafts.lock().await;
        drafts.insert(
            (group_id, sender.player_id),
            GuessDraft {
                digits: [None, None, None],
                picker_message_id: Some(picker_message_id),
            },
        );
        drop(drafts);
        self.gateway
            .answer_callback(
                callback_id,
                "🎯 Pick your guess with the buttons below!",
                false,
            )
            .await
    }

    async fn cb_pick(
        &self,
        callback_id: &str,
        group_id: GroupId,
        sender: &Sender,
        rest: &str,
    ) -> anyhow::Result<()> {
        let parsed = rest
            .split_once(':')
            .and_then(|(step, digit)| Some((step.parse::<usize>().ok()?, digit.parse::<u8>().ok()?)));
        let Some((step, digit)) = parsed else {
            return self
                .gateway
                .answer_callback(callback_id, "❌ Invalid selection", true)
                .await;
        };
        if step > 2 || digit > 9 {
            return self
                .gateway
                .answer_callback(callback_id, "❌ Invalid selection", true)
                .await;
        }

        let mut drafts = self.guess_drafts.lock().await;
        let Some(draft) = drafts.get_mut(&(group_id, sender.player_id)) else {
            drop(drafts);
            return self
                .gateway
                .answer_callback(callback_id, "⚠️ Session expired. Tap Guess again.", true)
                .await;
        };
        draft.digits[step] = Some(digit);
        let draft = draft.clone();
        drop(drafts);

        let Some(picker_message_id) = draft.picker_message_id else {
            return self
                .gateway
                .answer_callback(callback_id, "⚠️ Session expired. Tap Guess again.", true)
                .await;
        };

        if step < 2 {
            let next_step = step + 1;
            let max_digit = picker_max_digit(next_step, draft.digits[0]);
            let so_far: String = draft
                .digits
                .iter()
                .map(|d| d.map(|d| char::from(b'0' + d)).unwrap_or('_'))
                .collect();
            let text = format!(
                "🎯 Step {}/3: choose the {} digit (0-{max_digit})\n\nYour guess so far: {so_far}",
                next_step + 1,
                if next_step == 1 { "tens" } else { "units" },
            );
            self.gateway
                .edit_message(
                    group_id,
                    picker_message_id,
                    &text,
                    Some(picker_keyboard(next_step, max_digit)),
                )
                .await?;
        } else if let Some(value) = draft.value() {
            let text = format!("🎯 Confirm your guess: {value}°");
            self.gateway
                .edit_message(
                    group_id,
                    picker_message_id,
                    &text,
                    Some(confirm_keyboard(value)),
                )
                .await?;
        }
        self.gateway.answer_callback(callback_id, "", false).await
    }

    async fn cb_confirm(
        &self,
        callback_id: &str,
        group_id: GroupId,
        sender: &Sender,
        value: &str,
    ) -> anyhow::Result<()> {
        let Ok(guess) = value.parse::<i64>() else {
            return self
                .gateway
                .answer_callback(callback_id, "❌ Invalid confirmation", true)
                .await;
        };

        // No live draft means the button belongs to an earlier round's
        // picker; never treat it as a submission.
        let draft = {
            let drafts = self.guess_drafts.lock().await;
            drafts.get(&(group_id, sender.player_id)).cloned()
        };
        let Some(draft) = draft else {
            return self
                .gateway
                .answer_callback(callback_id, "⚠️ Session expired. Tap Guess again.", true)
                .await;
        };
        let picker_message_id = draft.picker_message_id;

        match self
            .manager
            .submit_guess(
                group_id,
                sender.player_id,
                &sender.display_name,
                guess,
                Utc::now(),
            )
            .await
        {
            Ok(outcome) => {
                self.guess_drafts
                    .lock()
                    .await
                    .remove(&(group_id, sender.player_id));
                if let Some(message_id) = picker_message_id
                    && let Err(err) = self.gateway.delete_message(group_id, message_id).await
                {
                    warn!(group_id, error = %err, "failed to delete picker message");
                }
                self.gateway
                    .answer_callback(
                        callback_id,
                        "✅ Guess submitted! Waiting for other players...",
                        true,
                    )
                    .await?;
                match outcome.completed {
                    Some(results) => {
                        self.announce_completion(&results, "🎉 Round Complete!")
                            .await;
                    }
                    None => {
                        if let Ok(Some(summary)) =
                            self.manager.round_status(group_id, Utc::now()).await
                        {
                            self.gateway
                                .send_message(group_id, &format_status(&summary), None)
                                .await?;
                        }
                    }
                }
                Ok(())
            }
            Err(err) => self.answer_game_error(callback_id, err).await,
        }
    }

    async fn cb_cancel(
        &self,
        callback_id: &str,
        group_id: GroupId,
        sender: &Sender,
    ) -> anyhow::Result<()> {
        let removed = self
            .guess_drafts
            .lock()
            .await
            .remove(&(group_id, sender.player_id));
        if let Some(draft) = removed
            && let Some(message_id) = draft.picker_message_id
        {
            let _ = self
                .gateway
                .edit_message(
                    group_id,
                    message_id,
                    "❌ Guess cancelled\n\nTap the Guess button again to restart.",
                    None,
                )
                .await;
        }
        self.gateway
            .answer_callback(callback_id, "❌ Guess cancelled.", false)
            .await
    }

    async fn clear_group_drafts(&self, group_id: GroupId) {
        self.guess_drafts
            .lock()
            .await
            .retain(|(draft_group, _), _| *draft_group != group_id);
    }

    /// Runs the timing check for one group and announces a completion
    /// if it happened. Storage failures are logged and skipped so one
    /// group cannot affect the others.
    async fn sweep_group(&self, group_id: GroupId, now: DateTime<Utc>) {
        match self.manager.evaluate_timeout(group_id, now).await {
            Ok(Some(results)) => {
                self.announce_completion(&results, "⏰ Time's up — Round Complete!")
                    .await;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(group_id, error = %err, "timeout sweep failed for group");
            }
        }
    }

    async fn render_angle(&self, angle: u16, show_label: bool) -> Result<ImageArtifact, GameError> {
        let renderer = self.renderer.clone();
        tokio::task::spawn_blocking(move || renderer.render_angle(angle, show_label))
            .await
            .map_err(|err| GameError::Render(err.to_string()))?
    }

    async fn announce_completion(&self, results: &RoundResults, header: &str) {
        // The round is gone, so any picker still open belongs to it and
        // must not carry into the next round.
        self.clear_group_drafts(results.group_id).await;
        let text = format_results(results, header);
        let outcome = match self.render_angle(results.target_angle, true).await {
            Ok(image) => self
                .gateway
                .send_photo(results.group_id, &image, &text, None)
                .await
                .map(|_| ()),
            Err(err) => {
                // The results still go out even if the reveal image
                // cannot be produced.
                error!(group_id = results.group_id, error = %err, "reveal rendering failed");
                self.gateway
                    .send_message(results.group_id, &text, None)
                    .await
                    .map(|_| ())
            }
        };
        if let Err(err) = outcome {
            error!(group_id = results.group_id, error = %err, "failed to announce round results");
        }
    }

    async fn report_game_error(&self, group_id: GroupId, err: GameError) -> anyhow::Result<()> {
        if !err.is_user_facing() {
            error!(group_id, error = %err, "command failed");
        }
        self.gateway
            .send_message(group_id, err.user_message(), None)
            .await?;
        Ok(())
    }

    async fn answer_game_error(&self, callback_id: &str, err: GameError) -> anyhow::Result<()> {
        if !err.is_user_facing() {
            error!(error = %err, "callback failed");
        }
        self.gateway
            .answer_callback(callback_id, err.user_message(), true)
            .await
    }
}

fn format_status(summary: &RoundSummary) -> String {
    let mut text = format!(
        "🎯 Round Status\n\n👥 Players: {}\n✅ Submitted: {}\n⏳ Pending: {}\n",
        summary.joined, summary.submitted, summary.pending
    );
    if summary.forfeited > 0 {
        text.push_str(&format!("❌ Forfeited: {}\n", summary.forfeited));
    }
    if summary.completes_in_seconds > 0 {
        text.push_str(&format!(
            "⏰ Min wait: {}s remaining\n",
            summary.completes_in_seconds
        ));
    } else {
        text.push_str(&format!("⏰ Time elapsed: {}s\n", summary.elapsed_seconds));
    }
    text
}

fn format_results(results: &RoundResults, header: &str) -> String {
    let mut text = format!(
        "{header}\n\n🎯 Correct angle: {}°\n\n",
        results.target_angle
    );
    if results.scores.is_empty() {
        text.push_str("😔 No valid submissions this round.");
    } else {
        text.push_str("🏆 Results:\n");
        for (index, score) in results.scores.iter().take(5).enumerate() {
            let medal = match index {
                0 => "🥇".to_string(),
                1 => "🥈".to_string(),
                2 => "🥉".to_string(),
                other => format!("{}.", other + 1),
            };
            text.push_str(&format!(
                "{medal} {}: {}° ({} pts, ±{}°)\n",
                score.display_name, score.guess, score.points, score.error
            ));
        }
        if results.scores.len() > 5 {
            text.push_str(&format!(
                "\n... and {} more players",
                results.scores.len() - 5
            ));
        }
    }
    text.push_str(&format!(
        "\n\n👥 Participation: {}/{} players",
        results.players_scored, results.total_players
    ));
    text
}

fn format_leaderboard(players: &[PlayerStats], limit: usize) -> String {
    let mut text = "🏆 Gangle Leaderboard\n\n".to_string();
    for (index, player) in players.iter().take(limit).enumerate() {
        let medal = match index {
            0 => "🥇".to_string(),
            1 => "🥈".to_string(),
            2 => "🥉".to_string(),
            other => format!("{}.", other + 1),
        };
        text.push_str(&format!(
            "{medal} {}\n    💯 {} points\n    🎮 {} rounds\n    🎯 Best: ±{}°\n\n",
            player.display_name, player.total_points, player.rounds_played, player.best_guess_error
        ));
    }
    text
}

/// Periodic force-complete sweep across every group with an active
/// round, so rounds end even when no further chat events arrive.
async fn run_timeout_sweeper(app: BotApp, sweep_interval: Duration) {
    let mut ticker = interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let group_ids = match app.manager.active_group_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "failed to list active rounds for sweep");
                continue;
            }
        };
        for group_id in group_ids {
            app.sweep_group(group_id, Utc::now()).await;
        }
    }
}

/// Long-poll loop: each inbound event is handled in its own task;
/// per-group ordering is preserved by the group locks.
async fn run_event_loop(app: BotApp) {
    loop {
        match app.gateway.poll_events().await {
            Ok(events) => {
                for event in events {
                    let app = app.clone();
                    tokio::spawn(async move {
                        app.handle_event(event).await;
                    });
                }
            }
            Err(err) => {
                warn!(error = %err, "event poll failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "bot_service=debug,tower_http=info".to_string()),
        )
        .init();

    let config = BotConfig::from_env();
    let token = config
        .telegram_bot_token
        .clone()
        .context("TELEGRAM_BOT_TOKEN is required")?;

    let storage = Arc::new(
        FileStorage::open(&config.data_dir)
            .await
            .context("failed to open data directory")?,
    );
    let leaderboard = Arc::new(Leaderboard::new(storage.clone()));
    let manager = Arc::new(RoundManager::new(storage, leaderboard.clone(), &config));
    let gateway: Arc<dyn MessagingGateway> =
        Arc::new(TelegramGateway::new(&token, config.poll_timeout_seconds));

    let app = BotApp {
        manager,
        leaderboard,
        gateway,
        renderer: Arc::new(SvgAngleRenderer),
        guess_drafts: Arc::new(Mutex::new(HashMap::new())),
    };

    let sweeper = app.clone();
    let sweep_interval = config.sweep_interval;
    tokio::spawn(async move {
        run_timeout_sweeper(sweeper, sweep_interval).await;
    });
    let poller = app.clone();
    tokio::spawn(async move {
        run_event_loop(poller).await;
    });

    let router = build_router(app);
    let bind_addr = parse_bind_addr("BOT_SERVICE_BIND", "0.0.0.0:8080")?;
    info!(%bind_addr, "bot-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

fn build_router(app: BotApp) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/v1/groups/{group_id}/leaderboard",
            get(leaderboard_handler),
        )
        .route("/v1/groups/{group_id}/round", get(round_status_handler))
        .with_state(app)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "bot-service"}))
}

async fn leaderboard_handler(
    State(app): State<BotApp>,
    Path(group_id): Path<GroupId>,
) -> Result<Json<Vec<PlayerStats>>, ApiError> {
    app.leaderboard
        .ranking(group_id)
        .await
        .map(Json)
        .map_err(|err| ApiError::internal(format!("failed to load leaderboard: {err}")))
}

async fn round_status_handler(
    State(app): State<BotApp>,
    Path(group_id): Path<GroupId>,
) -> Result<Json<Option<RoundSummary>>, ApiError> {
    app.manager
        .round_status(group_id, Utc::now())
        .await
        .map(Json)
        .map_err(|err| ApiError::internal(format!("failed to load round status: {err}")))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex as StdMutex;

    fn test_config(min_wait_seconds: i64, max_wait_seconds: i64) -> BotConfig {
        BotConfig {
            telegram_bot_token: None,
            data_dir: PathBuf::new(),
            max_players_per_round: 50,
            points_max: 100,
            min_wait_seconds,
            max_wait_seconds,
            sweep_interval: Duration::from_secs(5),
            poll_timeout_seconds: 1,
        }
    }

    async fn temp_storage() -> Arc<FileStorage> {
        let dir = std::env::temp_dir().join(format!("gangle-test-{}", Uuid::new_v4()));
        Arc::new(FileStorage::open(&dir).await.unwrap())
    }

    async fn manager_with(config: BotConfig) -> (Arc<RoundManager>, Arc<Leaderboard>) {
        let storage = temp_storage().await;
        let leaderboard = Arc::new(Leaderboard::new(storage.clone()));
        let manager = Arc::new(RoundManager::new(storage, leaderboard.clone(), &config));
        (manager, leaderboard)
    }

    /// Seeds a round with a known target angle and start time,
    /// bypassing the random generator.
    async fn seed_round(
        manager: &RoundManager,
        group_id: GroupId,
        target_angle: u16,
        started_at: DateTime<Utc>,
        started_by: Option<PlayerId>,
    ) {
        let round = Round::new(group_id, target_angle, started_by, started_at);
        manager.storage.save_round(&round).await.unwrap();
    }

    // --- storage ---

    #[tokio::test]
    async fn storage_round_trip_and_absent_semantics() {
        let storage = temp_storage().await;
        assert!(storage.load_round(-1).await.unwrap().is_none());
        storage.delete_round(-1).await.unwrap();

        let round = Round::new(-1, 42, Some(7), Utc::now());
        storage.save_round(&round).await.unwrap();
        let loaded = storage.load_round(-1).await.unwrap().unwrap();
        assert_eq!(loaded.target_angle, 42);
        assert_eq!(loaded.started_by, Some(7));

        storage.delete_round(-1).await.unwrap();
        assert!(storage.load_round(-1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn storage_corrupt_record_is_an_explicit_error() {
        let storage = temp_storage().await;
        tokio::fs::write(storage.round_path(-2), b"{not json")
            .await
            .unwrap();
        let err = storage.load_round(-2).await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn storage_save_replaces_atomically_without_leftover_temp_files() {
        let storage = temp_storage().await;
        let mut round = Round::new(-3, 10, None, Utc::now());
        storage.save_round(&round).await.unwrap();
        round.target_angle = 20;
        storage.save_round(&round).await.unwrap();

        assert_eq!(
            storage.load_round(-3).await.unwrap().unwrap().target_angle,
            20
        );

        let mut entries = tokio::fs::read_dir(&storage.games_dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().to_string();
            assert!(!name.contains(".tmp-"), "leftover temp file {name}");
        }
    }

    #[tokio::test]
    async fn storage_interrupted_write_leaves_old_record_intact() {
        let storage = temp_storage().await;
        let round = Round::new(-4, 33, None, Utc::now());
        storage.save_round(&round).await.unwrap();

        // A crash mid-save leaves only a stray temp file behind; the
        // real record must be unaffected and the temp file must never
        // be picked up as a round.
        let stray = storage
            .games_dir
            .join(format!("game_-4.json.tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&stray, b"{\"half\":").await.unwrap();

        assert_eq!(
            storage.load_round(-4).await.unwrap().unwrap().target_angle,
            33
        );
        let ids = storage.active_group_ids().await.unwrap();
        assert_eq!(ids, vec![-4]);
    }

    #[tokio::test]
    async fn storage_lists_active_groups_by_id() {
        let storage = temp_storage().await;
        storage
            .save_round(&Round::new(-10, 1, None, Utc::now()))
            .await
            .unwrap();
        storage
            .save_round(&Round::new(22, 2, None, Utc::now()))
            .await
            .unwrap();
        let mut ids = storage.active_group_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec![-10, 22]);
    }

    // --- round state machine ---

    #[tokio::test]
    async fn start_round_generates_angle_in_range_and_persists() {
        let (manager, _) = manager_with(test_config(30, 120)).await;
        let round = manager.start_round(-100, Some(1), Utc::now()).await.unwrap();
        assert!(round.target_angle < 360);
        assert_eq!(round.status, RoundStatus::WaitingForGuesses);
        let stored = manager.storage.load_round(-100).await.unwrap().unwrap();
        assert_eq!(stored.target_angle, round.target_angle);
    }

    #[tokio::test]
    async fn second_start_fails_and_leaves_the_round_untouched() {
        let (manager, _) = manager_with(test_config(30, 120)).await;
        let now = Utc::now();
        let first = manager.start_round(-100, Some(1), now).await.unwrap();
        let err = manager.start_round(-100, Some(2), now).await.unwrap_err();
        assert!(matches!(err, GameError::RoundAlreadyActive));
        let stored = manager.storage.load_round(-100).await.unwrap().unwrap();
        assert_eq!(stored.target_angle, first.target_angle);
        assert_eq!(stored.started_by, Some(1));
    }

    #[tokio::test]
    async fn guessing_without_a_round_fails() {
        let (manager, _) = manager_with(test_config(30, 120)).await;
        let err = manager
            .submit_guess(-100, 1, "alice", 45, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::NoActiveRound));
    }

    #[tokio::test]
    async fn out_of_range_guesses_are_rejected() {
        let (manager, _) = manager_with(test_config(30, 120)).await;
        let now = Utc::now();
        seed_round(&manager, -100, 90, now, None).await;
        for guess in [-1_i64, 360, 4000] {
            let err = manager
                .submit_guess(-100, 1, "alice", guess, now)
                .await
                .unwrap_err();
            assert!(matches!(err, GameError::InvalidGuess), "guess {guess}");
        }
        let stored = manager.storage.load_round(-100).await.unwrap().unwrap();
        assert!(stored.participants.is_empty());
    }

    #[tokio::test]
    async fn second_guess_is_rejected_and_the_original_kept() {
        let (manager, _) = manager_with(test_config(30, 120)).await;
        let now = Utc::now();
        seed_round(&manager, -100, 90, now, None).await;
        manager
            .submit_guess(-100, 1, "alice", 80, now)
            .await
            .unwrap();
        let err = manager
            .submit_guess(-100, 1, "alice", 99, now)
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::AlreadySubmitted));
        let stored = manager.storage.load_round(-100).await.unwrap().unwrap();
        assert_eq!(stored.participant(1).unwrap().guess, Some(80));
    }

    #[tokio::test]
    async fn round_capacity_is_enforced_for_new_players_only() {
        let mut config = test_config(30, 120);
        config.max_players_per_round = 2;
        let (manager, _) = manager_with(config).await;
        let now = Utc::now();
        seed_round(&manager, -100, 90, now, None).await;

        manager.join_round(-100, 1, "alice").await.unwrap();
        manager.join_round(-100, 2, "bob").await.unwrap();
        let err = manager.join_round(-100, 3, "carol").await.unwrap_err();
        assert!(matches!(err, GameError::RoundFull));

        // An existing participant is unaffected by the cap.
        manager.join_round(-100, 1, "alice2").await.unwrap();
        let stored = manager.storage.load_round(-100).await.unwrap().unwrap();
        assert_eq!(stored.participant(1).unwrap().display_name, "alice2");
    }

    #[tokio::test]
    async fn a_full_round_turns_away_new_players_before_judging_their_guess() {
        let mut config = test_config(30, 120);
        config.max_players_per_round = 1;
        let (manager, _) = manager_with(config).await;
        let now = Utc::now();
        seed_round(&manager, -100, 90, now, None).await;
        manager.join_round(-100, 1, "alice").await.unwrap();

        let err = manager
            .submit_guess(-100, 2, "bob", 999, now)
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::RoundFull));

        // An existing participant still gets the validity error, and
        // the bad guess is never recorded.
        let err = manager
            .submit_guess(-100, 1, "alice", 999, now)
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::InvalidGuess));
        let stored = manager.storage.load_round(-100).await.unwrap().unwrap();
        assert_eq!(stored.participant(1).unwrap().guess, None);
    }

    #[tokio::test]
    async fn round_stays_open_before_min_wait_even_when_everyone_guessed() {
        let (manager, leaderboard) = manager_with(test_config(30, 120)).await;
        let started = Utc::now();
        seed_round(&manager, -100, 90, started, None).await;

        let outcome = manager
            .submit_guess(-100, 1, "alice", 90, started + ChronoDuration::seconds(5))
            .await
            .unwrap();
        assert!(outcome.completed.is_none());

        // Still inside the min wait window.
        let result = manager
            .evaluate_timeout(-100, started + ChronoDuration::seconds(10))
            .await
            .unwrap();
        assert!(result.is_none());

        // Past the min wait with everyone submitted: completes.
        let results = manager
            .evaluate_timeout(-100, started + ChronoDuration::seconds(31))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(results.scores.len(), 1);
        assert_eq!(results.scores[0].points, 100);

        // Calling again is a no-op and nothing double-scores.
        let again = manager
            .evaluate_timeout(-100, started + ChronoDuration::seconds(60))
            .await
            .unwrap();
        assert!(again.is_none());
        let ranking = leaderboard.ranking(-100).await.unwrap();
        assert_eq!(ranking.len(), 1);
        assert_eq!(ranking[0].rounds_played, 1);
        assert_eq!(ranking[0].total_points, 100);
    }

    #[tokio::test]
    async fn max_wait_forces_completion_and_silent_players_score_nothing() {
        let (manager, leaderboard) = manager_with(test_config(30, 120)).await;
        let started = Utc::now();
        seed_round(&manager, -100, 90, started, None).await;
        manager
            .submit_guess(-100, 1, "alice", 95, started + ChronoDuration::seconds(5))
            .await
            .unwrap();
        manager.join_round(-100, 2, "bob").await.unwrap();

        // Bob never guesses; before max wait nothing happens.
        assert!(
            manager
                .evaluate_timeout(-100, started + ChronoDuration::seconds(119))
                .await
                .unwrap()
                .is_none()
        );

        let results = manager
            .evaluate_timeout(-100, started + ChronoDuration::seconds(121))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(results.scores.len(), 1);
        assert_eq!(results.scores[0].player_id, 1);
        assert_eq!(results.scores[0].points, 97);
        assert_eq!(results.total_players, 2);

        // Bob completed nothing, so he has no stats entry.
        let ranking = leaderboard.ranking(-100).await.unwrap();
        assert_eq!(ranking.len(), 1);
        assert_eq!(ranking[0].player_id, 1);
    }

    #[tokio::test]
    async fn forfeit_requires_admin_and_a_known_target() {
        let (manager, _) = manager_with(test_config(30, 120)).await;
        let now = Utc::now();
        seed_round(&manager, -100, 90, now, None).await;
        manager.join_round(-100, 1, "alice").await.unwrap();

        let err = manager.forfeit(-100, false, 1, now).await.unwrap_err();
        assert!(matches!(err, GameError::NotAuthorized));
        let err = manager.forfeit(-100, true, 99, now).await.unwrap_err();
        assert!(matches!(err, GameError::PlayerNotInRound));
    }

    #[tokio::test]
    async fn forfeiting_the_last_pending_player_completes_after_min_wait() {
        let (manager, _) = manager_with(test_config(30, 120)).await;
        let started = Utc::now() - ChronoDuration::seconds(40);
        seed_round(&manager, -100, 90, started, None).await;
        manager
            .submit_guess(-100, 1, "alice", 92, started + ChronoDuration::seconds(2))
            .await
            .unwrap();
        manager.join_round(-100, 2, "bob").await.unwrap();

        let outcome = manager.forfeit(-100, true, 2, Utc::now()).await.unwrap();
        assert_eq!(outcome.display_name, "bob");
        let results = outcome.completed.unwrap();
        assert_eq!(results.scores.len(), 1);
        assert_eq!(results.scores[0].player_id, 1);
    }

    #[tokio::test]
    async fn forfeit_before_min_wait_leaves_the_round_open() {
        let (manager, _) = manager_with(test_config(30, 120)).await;
        let started = Utc::now();
        seed_round(&manager, -100, 90, started, None).await;
        manager
            .submit_guess(-100, 1, "alice", 92, started + ChronoDuration::seconds(1))
            .await
            .unwrap();
        manager.join_round(-100, 2, "bob").await.unwrap();

        let outcome = manager
            .forfeit(-100, true, 2, started + ChronoDuration::seconds(5))
            .await
            .unwrap();
        assert!(outcome.completed.is_none());
        assert!(manager.storage.load_round(-100).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn forfeited_players_cannot_guess() {
        let (manager, _) = manager_with(test_config(30, 120)).await;
        let now = Utc::now();
        seed_round(&manager, -100, 90, now, None).await;
        manager.join_round(-100, 1, "alice").await.unwrap();
        manager.forfeit(-100, true, 1, now).await.unwrap();
        let err = manager
            .submit_guess(-100, 1, "alice", 45, now)
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::PlayerNotInRound));
    }

    #[tokio::test]
    async fn scoring_matches_the_linear_decay_policy() {
        let (manager, _) = manager_with(test_config(0, 120)).await;
        let started = Utc::now() - ChronoDuration::seconds(1);
        seed_round(&manager, -100, 90, started, None).await;
        let now = Utc::now();
        // All three join first so the round stays open (pending
        // players) until the final guess lands.
        manager.join_round(-100, 1, "exact").await.unwrap();
        manager.join_round(-100, 2, "opposite").await.unwrap();
        manager.join_round(-100, 3, "close").await.unwrap();
        manager
            .submit_guess(-100, 1, "exact", 90, now)
            .await
            .unwrap();
        manager
            .submit_guess(-100, 2, "opposite", 270, now)
            .await
            .unwrap();
        let outcome = manager
            .submit_guess(-100, 3, "close", 95, now)
            .await
            .unwrap();

        let results = outcome.completed.unwrap();
        assert_eq!(results.target_angle, 90);
        // Sorted by points descending, ties by lower error.
        assert_eq!(results.scores[0].display_name, "exact");
        assert_eq!(results.scores[0].points, 100);
        assert_eq!(results.scores[1].display_name, "close");
        assert_eq!(results.scores[1].points, 97);
        assert_eq!(results.scores[1].error, 5);
        assert_eq!(results.scores[2].display_name, "opposite");
        assert_eq!(results.scores[2].points, 0);
        assert_eq!(results.scores[2].error, 180);
    }

    #[tokio::test]
    async fn stats_accumulate_across_rounds() {
        let (manager, leaderboard) = manager_with(test_config(0, 120)).await;
        for (target, guess) in [(90_u16, 95_i64), (180, 180)] {
            let started = Utc::now() - ChronoDuration::seconds(1);
            seed_round(&manager, -100, target, started, None).await;
            let outcome = manager
                .submit_guess(-100, 1, "alice", guess, Utc::now())
                .await
                .unwrap();
            assert!(outcome.completed.is_some());
        }
        let ranking = leaderboard.ranking(-100).await.unwrap();
        assert_eq!(ranking.len(), 1);
        assert_eq!(ranking[0].rounds_played, 2);
        assert_eq!(ranking[0].total_points, 197);
        assert_eq!(ranking[0].best_guess_error, 0);
    }

    #[tokio::test]
    async fn cancel_discards_the_round_without_scoring() {
        let (manager, leaderboard) = manager_with(test_config(0, 120)).await;
        let started = Utc::now();
        seed_round(&manager, -100, 90, started, None).await;
        // Bob stays pending so alice's guess cannot complete the round.
        manager.join_round(-100, 2, "bob").await.unwrap();
        manager
            .submit_guess(-100, 1, "alice", 90, started)
            .await
            .unwrap();

        let err = manager.cancel_round(-100, false).await.unwrap_err();
        assert!(matches!(err, GameError::NotAuthorized));

        let cancelled = manager.cancel_round(-100, true).await.unwrap();
        assert_eq!(cancelled.status, RoundStatus::Cancelled);
        assert!(manager.storage.load_round(-100).await.unwrap().is_none());
        assert!(leaderboard.ranking(-100).await.unwrap().is_empty());

        // The group can immediately start a fresh round.
        manager.start_round(-100, None, Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn the_starter_may_end_early_but_strangers_may_not() {
        let (manager, _) = manager_with(test_config(30, 120)).await;
        let started = Utc::now();
        seed_round(&manager, -100, 90, started, Some(7)).await;
        manager
            .submit_guess(-100, 7, "starter", 100, started)
            .await
            .unwrap();

        let err = manager
            .end_round(-100, 8, false, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::NotAuthorized));

        // Ending early skips the min wait entirely.
        let results = manager.end_round(-100, 7, false, Utc::now()).await.unwrap();
        assert_eq!(results.scores.len(), 1);
        assert!(manager.storage.load_round(-100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_round_record_reads_as_no_active_round() {
        let (manager, _) = manager_with(test_config(30, 120)).await;
        tokio::fs::write(manager.storage.round_path(-100), b"garbage")
            .await
            .unwrap();
        let err = manager
            .submit_guess(-100, 1, "alice", 45, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::NoActiveRound));
        // And a new round can be started over it.
        manager.start_round(-100, None, Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn evaluate_timeout_with_no_round_is_a_noop() {
        let (manager, _) = manager_with(test_config(30, 120)).await;
        assert!(
            manager
                .evaluate_timeout(-100, Utc::now())
                .await
                .unwrap()
                .is_none()
        );
    }

    // --- leaderboard engine ---

    fn scored(player_id: PlayerId, name: &str, points: u32, error: u16) -> ScoredGuess {
        ScoredGuess {
            player_id,
            display_name: name.to_string(),
            guess: 0,
            error,
            points,
        }
    }

    #[tokio::test]
    async fn ranking_orders_by_points_then_error_then_registration() {
        let storage = temp_storage().await;
        let leaderboard = Leaderboard::new(storage);
        let early = Utc::now();
        let late = early + ChronoDuration::seconds(10);
        let later = late + ChronoDuration::seconds(10);

        leaderboard
            .record_results(-5, early, &[scored(1, "first", 50, 20)], early)
            .await
            .unwrap();
        leaderboard
            .record_results(
                -5,
                late,
                &[scored(2, "sharper", 50, 5), scored(3, "leader", 80, 40)],
                late,
            )
            .await
            .unwrap();
        leaderboard
            .record_results(-5, later, &[scored(4, "tied-later", 50, 20)], late)
            .await
            .unwrap();

        let ranking = leaderboard.ranking(-5).await.unwrap();
        let ids: Vec<PlayerId> = ranking.iter().map(|p| p.player_id).collect();
        // 3 leads on points; 2 beats 1 and 4 on error; 1 beats 4 on
        // earlier registration.
        assert_eq!(ids, vec![3, 2, 1, 4]);
    }

    #[tokio::test]
    async fn empty_ranking_is_a_sentinel_not_an_error() {
        let storage = temp_storage().await;
        let leaderboard = Leaderboard::new(storage);
        assert!(leaderboard.ranking(-6).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_backs_up_before_clearing_and_data_is_recoverable() {
        let storage = temp_storage().await;
        let leaderboard = Leaderboard::new(storage);
        let now = Utc::now();
        leaderboard
            .record_results(-7, now, &[scored(1, "alice", 97, 5)], now)
            .await
            .unwrap();

        let backup = leaderboard.reset(-7, now).await.unwrap().unwrap();
        assert!(leaderboard.ranking(-7).await.unwrap().is_empty());

        let raw = tokio::fs::read_to_string(&backup).await.unwrap();
        let recovered: GroupLeaderboard = serde_json::from_str(&raw).unwrap();
        assert_eq!(recovered.players.get(&1).unwrap().total_points, 97);
    }

    #[tokio::test]
    async fn reapplying_the_same_round_does_not_double_score() {
        let storage = temp_storage().await;
        let leaderboard = Leaderboard::new(storage);
        let now = Utc::now();
        let round_started = now - ChronoDuration::seconds(60);

        // A completion retry (round-file delete failed after the stats
        // were written) replays the identical upsert.
        for _ in 0..2 {
            leaderboard
                .record_results(-9, round_started, &[scored(1, "alice", 97, 5)], now)
                .await
                .unwrap();
        }

        let ranking = leaderboard.ranking(-9).await.unwrap();
        assert_eq!(ranking.len(), 1);
        assert_eq!(ranking[0].total_points, 97);
        assert_eq!(ranking[0].rounds_played, 1);
    }

    #[tokio::test]
    async fn reset_of_an_absent_leaderboard_produces_no_backup() {
        let storage = temp_storage().await;
        let leaderboard = Leaderboard::new(storage);
        assert!(leaderboard.reset(-8, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reset_through_the_manager_requires_admin() {
        let (manager, _) = manager_with(test_config(30, 120)).await;
        let err = manager
            .reset_leaderboard(-100, false, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::NotAuthorized));
    }

    // --- picker and command parsing ---

    #[test]
    fn picker_caps_keep_the_value_in_range() {
        assert_eq!(picker_max_digit(0, None), 3);
        assert_eq!(picker_max_digit(1, Some(3)), 5);
        assert_eq!(picker_max_digit(1, Some(2)), 9);
        assert_eq!(picker_max_digit(2, Some(3)), 9);

        let draft = GuessDraft {
            digits: [Some(3), Some(5), Some(9)],
            picker_message_id: None,
        };
        assert_eq!(draft.value(), Some(359));
    }

    #[test]
    fn picker_keyboard_layout_has_digits_then_cancel() {
        let keyboard = picker_keyboard(0, 3);
        assert_eq!(keyboard.len(), 2);
        assert_eq!(keyboard[0].len(), 4);
        assert_eq!(keyboard[0][3].callback_data, "pick:0:3");
        assert_eq!(keyboard[1][0].callback_data, CALLBACK_CANCEL);

        let full = picker_keyboard(2, 9);
        assert_eq!(full[0].len(), 5);
        assert_eq!(full[1].len(), 5);
        assert_eq!(full[2][0].callback_data, CALLBACK_CANCEL);
    }

    #[test]
    fn commands_parse_with_bot_suffix_and_args() {
        assert_eq!(
            parse_command("/start_round@GangleBot"),
            Some(("start_round".to_string(), vec![]))
        );
        assert_eq!(
            parse_command("/forfeit @bob"),
            Some(("forfeit".to_string(), vec!["@bob".to_string()]))
        );
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/"), None);
    }

    #[test]
    fn telegram_envelopes_parse_with_and_without_result() {
        let ok: TgResponse<TgMessage> = serde_json::from_str(
            r#"{"ok":true,"result":{"message_id":5,"chat":{"id":-100,"type":"group"}}}"#,
        )
        .unwrap();
        assert!(ok.ok);
        assert_eq!(ok.result.unwrap().message_id, 5);

        let failed: TgResponse<TgMessage> =
            serde_json::from_str(r#"{"ok":false,"description":"chat not found"}"#).unwrap();
        assert!(!failed.ok);
        assert!(failed.result.is_none());
        assert_eq!(failed.description.as_deref(), Some("chat not found"));
    }

    // --- renderer ---

    #[test]
    fn svg_renderer_marks_reflex_arcs_and_labels_only_reveals() {
        let plain = render_angle_svg(90, 0, false);
        let body = String::from_utf8(plain.bytes).unwrap();
        assert!(body.starts_with("<svg"));
        assert!(body.contains(r#"stroke="gray" stroke-dasharray"#));
        assert!(body.contains("A 56 56 0 0 0"));
        assert!(!body.contains("<text"));
        assert_eq!(plain.file_name, "angle.svg");

        let reflex = render_angle_svg(270, 45, true);
        let body = String::from_utf8(reflex.bytes).unwrap();
        assert!(body.contains("A 56 56 0 1 0"));
        assert!(body.contains("270°"));
        assert_eq!(reflex.file_name, "reveal.svg");
    }

    // --- orchestrator with a recording gateway ---

    #[derive(Default)]
    struct RecordingGateway {
        messages: StdMutex<Vec<(GroupId, String)>>,
        photos: StdMutex<Vec<(GroupId, String)>>,
        answers: StdMutex<Vec<(String, String)>>,
        next_message_id: StdMutex<MessageId>,
    }

    impl RecordingGateway {
        fn messages(&self) -> Vec<(GroupId, String)> {
            self.messages.lock().unwrap().clone()
        }

        fn photos(&self) -> Vec<(GroupId, String)> {
            self.photos.lock().unwrap().clone()
        }

        fn answers(&self) -> Vec<(String, String)> {
            self.answers.lock().unwrap().clone()
        }

        fn next_id(&self) -> MessageId {
            let mut id = self.next_message_id.lock().unwrap();
            *id += 1;
            *id
        }
    }

    #[async_trait]
    impl MessagingGateway for RecordingGateway {
        async fn poll_events(&self) -> anyhow::Result<Vec<InboundEvent>> {
            Ok(Vec::new())
        }

        async fn send_message(
            &self,
            group_id: GroupId,
            text: &str,
            _keyboard: Option<Keyboard>,
        ) -> anyhow::Result<MessageId> {
            self.messages
                .lock()
                .unwrap()
                .push((group_id, text.to_string()));
            Ok(self.next_id())
        }

        async fn edit_message(
            &self,
            group_id: GroupId,
            _message_id: MessageId,
            text: &str,
            _keyboard: Option<Keyboard>,
        ) -> anyhow::Result<()> {
            self.messages
                .lock()
                .unwrap()
                .push((group_id, text.to_string()));
            Ok(())
        }

        async fn delete_message(
            &self,
            _group_id: GroupId,
            _message_id: MessageId,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send_photo(
            &self,
            group_id: GroupId,
            _image: &ImageArtifact,
            caption: &str,
            _keyboard: Option<Keyboard>,
        ) -> anyhow::Result<MessageId> {
            self.photos
                .lock()
                .unwrap()
                .push((group_id, caption.to_string()));
            Ok(self.next_id())
        }

        async fn answer_callback(
            &self,
            callback_id: &str,
            text: &str,
            _show_alert: bool,
        ) -> anyhow::Result<()> {
            self.answers
                .lock()
                .unwrap()
                .push((callback_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    async fn test_app(config: BotConfig) -> (BotApp, Arc<RecordingGateway>) {
        let storage = temp_storage().await;
        let leaderboard = Arc::new(Leaderboard::new(storage.clone()));
        let manager = Arc::new(RoundManager::new(storage, leaderboard.clone(), &config));
        let gateway = Arc::new(RecordingGateway::default());
        let app = BotApp {
            manager,
            leaderboard,
            gateway: gateway.clone(),
            renderer: Arc::new(SvgAngleRenderer),
            guess_drafts: Arc::new(Mutex::new(HashMap::new())),
        };
        (app, gateway)
    }

    fn player(player_id: PlayerId, name: &str, is_admin: bool) -> Sender {
        Sender {
            player_id,
            display_name: name.to_string(),
            is_admin,
        }
    }

    #[tokio::test]
    async fn start_round_command_posts_the_angle_photo_with_a_guess_button() {
        let (app, gateway) = test_app(test_config(30, 120)).await;
        app.handle_event(InboundEvent::Command {
            group_id: -100,
            chat_kind: ChatKind::Group,
            sender: player(1, "alice", false),
            name: "start_round".to_string(),
            args: vec![],
        })
        .await;

        let photos = gateway.photos();
        assert_eq!(photos.len(), 1);
        assert!(photos[0].1.contains("Guess the angle"));

        // Starting again is answered with the friendly conflict text.
        app.handle_event(InboundEvent::Command {
            group_id: -100,
            chat_kind: ChatKind::Group,
            sender: player(2, "bob", false),
            name: "start_round".to_string(),
            args: vec![],
        })
        .await;
        let messages = gateway.messages();
        assert!(
            messages
                .iter()
                .any(|(_, text)| text.contains("already active"))
        );
    }

    #[tokio::test]
    async fn start_round_is_rejected_outside_group_chats() {
        let (app, gateway) = test_app(test_config(30, 120)).await;
        app.handle_event(InboundEvent::Command {
            group_id: 55,
            chat_kind: ChatKind::Private,
            sender: player(55, "alice", false),
            name: "start_round".to_string(),
            args: vec![],
        })
        .await;
        assert!(gateway.photos().is_empty());
        assert!(
            gateway
                .messages()
                .iter()
                .any(|(_, text)| text.contains("group chats"))
        );
    }

    #[tokio::test]
    async fn picker_flow_records_the_confirmed_guess() {
        let (app, gateway) = test_app(test_config(30, 120)).await;
        seed_round(&app.manager, -100, 90, Utc::now(), None).await;

        let sender = player(1, "alice", false);
        app.handle_event(InboundEvent::Callback {
            callback_id: "cb1".to_string(),
            group_id: -100,
            sender: sender.clone(),
            data: CALLBACK_GUESS.to_string(),
        })
        .await;
        for (step, digit) in [(0, 0_u8), (1, 9), (2, 5)] {
            app.handle_event(InboundEvent::Callback {
                callback_id: format!("cb-pick-{step}"),
                group_id: -100,
                sender: sender.clone(),
                data: format!("pick:{step}:{digit}"),
            })
            .await;
        }
        app.handle_event(InboundEvent::Callback {
            callback_id: "cb-confirm".to_string(),
            group_id: -100,
            sender: sender.clone(),
            data: "confirm:95".to_string(),
        })
        .await;

        let stored = app.manager.storage.load_round(-100).await.unwrap().unwrap();
        assert_eq!(stored.participant(1).unwrap().guess, Some(95));
        assert!(
            gateway
                .answers()
                .iter()
                .any(|(_, text)| text.contains("Guess submitted"))
        );

        // A second confirmation attempt is refused.
        app.handle_event(InboundEvent::Callback {
            callback_id: "cb-again".to_string(),
            group_id: -100,
            sender,
            data: "confirm:10".to_string(),
        })
        .await;
        let stored = app.manager.storage.load_round(-100).await.unwrap().unwrap();
        assert_eq!(stored.participant(1).unwrap().guess, Some(95));
    }

    #[tokio::test]
    async fn stale_pickers_are_dropped_when_the_round_completes() {
        let (app, gateway) = test_app(test_config(30, 120)).await;
        seed_round(&app.manager, -100, 90, Utc::now(), Some(9)).await;
        app.manager
            .submit_guess(-100, 1, "dave", 92, Utc::now())
            .await
            .unwrap();

        // Alice opens a picker but never confirms.
        let alice = player(2, "alice", false);
        app.handle_event(InboundEvent::Callback {
            callback_id: "cb-open".to_string(),
            group_id: -100,
            sender: alice.clone(),
            data: CALLBACK_GUESS.to_string(),
        })
        .await;
        assert!(app.guess_drafts.lock().await.contains_key(&(-100, 2)));

        // The starter ends the round while alice's picker is open.
        app.handle_event(InboundEvent::Command {
            group_id: -100,
            chat_kind: ChatKind::Group,
            sender: player(9, "starter", false),
            name: "end_round".to_string(),
            args: vec![],
        })
        .await;
        assert!(app.manager.storage.load_round(-100).await.unwrap().is_none());
        assert!(app.guess_drafts.lock().await.is_empty());

        // A fresh round begins; alice's leftover Confirm button must
        // not be recorded as a guess she never made.
        seed_round(&app.manager, -100, 10, Utc::now(), None).await;
        app.handle_event(InboundEvent::Callback {
            callback_id: "cb-stale".to_string(),
            group_id: -100,
            sender: alice,
            data: "confirm:95".to_string(),
        })
        .await;
        let stored = app.manager.storage.load_round(-100).await.unwrap().unwrap();
        assert!(stored.participant(2).is_none());
        assert!(
            gateway
                .answers()
                .iter()
                .any(|(id, text)| id == "cb-stale" && text.contains("expired"))
        );
    }

    #[tokio::test]
    async fn inbound_events_double_as_timeout_ticks() {
        let (app, gateway) = test_app(test_config(30, 120)).await;
        let started = Utc::now() - ChronoDuration::seconds(200);
        seed_round(&app.manager, -100, 90, started, None).await;
        app.manager
            .submit_guess(-100, 1, "alice", 92, started + ChronoDuration::seconds(2))
            .await
            .unwrap();

        // Any group event past the max wait closes the round.
        app.handle_event(InboundEvent::Command {
            group_id: -100,
            chat_kind: ChatKind::Group,
            sender: player(2, "bob", false),
            name: "status".to_string(),
            args: vec![],
        })
        .await;

        assert!(app.manager.storage.load_round(-100).await.unwrap().is_none());
        assert!(
            gateway
                .photos()
                .iter()
                .any(|(_, caption)| caption.contains("Correct angle: 90°"))
        );
    }

    #[tokio::test]
    async fn forfeit_command_resolves_the_target_by_name() {
        let (app, gateway) = test_app(test_config(30, 120)).await;
        seed_round(&app.manager, -100, 90, Utc::now(), None).await;
        app.manager.join_round(-100, 5, "bob").await.unwrap();

        app.handle_event(InboundEvent::Command {
            group_id: -100,
            chat_kind: ChatKind::Group,
            sender: player(1, "admin", true),
            name: "forfeit".to_string(),
            args: vec!["@Bob".to_string()],
        })
        .await;

        let stored = app.manager.storage.load_round(-100).await.unwrap().unwrap();
        assert!(stored.participant(5).unwrap().forfeited);
        assert!(
            gateway
                .messages()
                .iter()
                .any(|(_, text)| text.contains("forfeited"))
        );
    }

    #[tokio::test]
    async fn reset_leaderboard_command_is_admin_gated() {
        let (app, gateway) = test_app(test_config(0, 120)).await;
        let started = Utc::now() - ChronoDuration::seconds(1);
        seed_round(&app.manager, -100, 90, started, None).await;
        app.manager
            .submit_guess(-100, 1, "alice", 90, Utc::now())
            .await
            .unwrap();

        app.handle_event(InboundEvent::Command {
            group_id: -100,
            chat_kind: ChatKind::Group,
            sender: player(2, "bob", false),
            name: "reset_leaderboard".to_string(),
            args: vec![],
        })
        .await;
        assert!(!app.leaderboard.ranking(-100).await.unwrap().is_empty());

        app.handle_event(InboundEvent::Command {
            group_id: -100,
            chat_kind: ChatKind::Group,
            sender: player(3, "admin", true),
            name: "reset_leaderboard".to_string(),
            args: vec![],
        })
        .await;
        assert!(app.leaderboard.ranking(-100).await.unwrap().is_empty());
        assert!(
            gateway
                .messages()
                .iter()
                .any(|(_, text)| text.contains("has been reset"))
        );
    }

    #[tokio::test]
    async fn results_formatting_shows_medals_and_participation() {
        let results = RoundResults {
            group_id: -100,
            target_angle: 90,
            scores: vec![
                scored(1, "alice", 100, 0),
                scored(2, "bob", 97, 5),
                scored(3, "carol", 0, 180),
            ],
            total_players: 4,
            players_scored: 3,
            started_at: Utc::now(),
            completed_at: Utc::now(),
        };
        let text = format_results(&results, "🎉 Round Complete!");
        assert!(text.contains("Correct angle: 90°"));
        assert!(text.contains("🥇 alice"));
        assert!(text.contains("🥈 bob"));
        assert!(text.contains("3/4 players"));
    }
}
