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

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_PLAYERS_PER_ROUND: usize = 50;
pub const DEFAULT_POINTS_MAX: u32 = 100;
pub const DEFAULT_MIN_WAIT_SECONDS: i64 = 30;
pub const DEFAULT_MAX_WAIT_SECONDS: i64 = 120;

/// Largest possible circular angular error on a 360° circle.
pub const MAX_CIRCULAR_ERROR: u16 = 180;

pub type GroupId = i64;
pub type PlayerId = i64;
pub type MessageId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundStatus {
    WaitingForGuesses,
    Completed,
    Cancelled,
}

/// A player who joined the current round, whether or not they have
/// guessed yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub player_id: PlayerId,
    pub display_name: String,
    pub guess: Option<u16>,
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub forfeited: bool,
}

impl Participant {
    pub fn new(player_id: PlayerId, display_name: impl Into<String>) -> Self {
        Self {
            player_id,
            display_name: display_name.into(),
            guess: None,
            submitted_at: None,
            forfeited: false,
        }
    }

    /// A participant is pending while they have neither guessed nor
    /// been forfeited.
    pub fn is_pending(&self) -> bool {
        !self.forfeited && self.guess.is_none()
    }

    /// A participant counts for scoring only with a recorded guess and
    /// no forfeit.
    pub fn is_scorable(&self) -> bool {
        !self.forfeited && self.guess.is_some()
    }
}

/// One instance of the guess-the-angle game for a group.
///
/// `target_angle` is fixed at creation. `participants` keeps join
/// order for display purposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub group_id: GroupId,
    pub target_angle: u16,
    pub status: RoundStatus,
    pub participants: Vec<Participant>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub started_by: Option<PlayerId>,
}

impl Round {
    pub fn new(
        group_id: GroupId,
        target_angle: u16,
        started_by: Option<PlayerId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            group_id,
            target_angle,
            status: RoundStatus::WaitingForGuesses,
            participants: Vec::new(),
            started_at: now,
            started_by,
        }
    }

    pub fn participant(&self, player_id: PlayerId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.player_id == player_id)
    }

    pub fn participant_mut(&mut self, player_id: PlayerId) -> Option<&mut Participant> {
        self.participants
            .iter_mut()
            .find(|p| p.player_id == player_id)
    }

    pub fn submitted_count(&self) -> usize {
        self.participants.iter().filter(|p| p.guess.is_some()).count()
    }

    pub fn forfeited_count(&self) -> usize {
        self.participants.iter().filter(|p| p.forfeited).count()
    }

    pub fn pending_count(&self) -> usize {
        self.participants.iter().filter(|p| p.is_pending()).count()
    }

    /// True when every non-forfeited participant has guessed and at
    /// least one guess will score.
    pub fn all_submitted(&self) -> bool {
        self.pending_count() == 0 && self.participants.iter().any(|p| p.is_scorable())
    }

    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_seconds()
    }
}

/// Per-group aggregate of a player's performance across rounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerStats {
    pub player_id: PlayerId,
    pub display_name: String,
    pub total_points: u64,
    pub rounds_played: u32,
    /// Minimum absolute angular error ever achieved; starts at the
    /// worst possible value.
    pub best_guess_error: u16,
    pub first_seen_at: DateTime<Utc>,
    pub last_played_at: Option<DateTime<Utc>>,
}

impl PlayerStats {
    pub fn new(player_id: PlayerId, display_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            player_id,
            display_name: display_name.into(),
            total_points: 0,
            rounds_played: 0,
            best_guess_error: MAX_CIRCULAR_ERROR,
            first_seen_at: now,
            last_played_at: None,
        }
    }
}

/// The durable per-group leaderboard record.
///
/// `last_scored_round` is the `started_at` of the most recently scored
/// round. A completion retry (round-file delete failed after the stats
/// were written) checks it before upserting, so a round's scores are
/// applied exactly once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupLeaderboard {
    #[serde(default)]
    pub players: HashMap<PlayerId, PlayerStats>,
    #[serde(default)]
    pub last_scored_round: Option<DateTime<Utc>>,
}

/// One participant's scored guess inside completed-round results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredGuess {
    pub player_id: PlayerId,
    pub display_name: String,
    pub guess: u16,
    pub error: u16,
    pub points: u32,
}

/// Outcome of a round's transition into COMPLETED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundResults {
    pub group_id: GroupId,
    pub target_angle: u16,
    /// Sorted by points descending, ties broken by lower error.
    pub scores: Vec<ScoredGuess>,
    pub total_players: usize,
    pub players_scored: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Shortest distance between two angles on a 360° circle.
pub fn circular_error(guess: u16, target: u16) -> u16 {
    let diff = (i32::from(guess % 360) - i32::from(target % 360)).unsigned_abs() as u16;
    diff.min(360 - diff)
}

/// Points for a guess: linear decay from `points_max` at 0° error to
/// zero at the maximum circular error of 180°.
pub fn score_points(points_max: u32, error: u16) -> u32 {
    let error = error.min(MAX_CIRCULAR_ERROR);
    let scale = 1.0 - f64::from(error) / f64::from(MAX_CIRCULAR_ERROR);
    (f64::from(points_max) * scale).round() as u32
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record at {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode record for {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum GameError {
    #[error("round already active")]
    RoundAlreadyActive,
    #[error("no active round")]
    NoActiveRound,
    #[error("round is full")]
    RoundFull,
    #[error("invalid guess")]
    InvalidGuess,
    #[error("guess already submitted")]
    AlreadySubmitted,
    #[error("player not in round")]
    PlayerNotInRound,
    #[error("not authorized")]
    NotAuthorized,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("angle rendering failed: {0}")]
    Render(String),
}

impl GameError {
    /// Expected conditions are answered to the chat; storage and
    /// render failures are operational and get logged instead.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, Self::Storage(_) | Self::Render(_))
    }

    /// Friendly text surfaced to the originating chat or player.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::RoundAlreadyActive => {
                "🎯 A round is already active! Players can still submit guesses."
            }
            Self::NoActiveRound => "❌ No active round. Use /start_round to begin a new round.",
            Self::RoundFull => "🚫 This round is full — wait for the next one!",
            Self::InvalidGuess => "❌ Guesses must be a whole number between 0 and 359 degrees.",
            Self::AlreadySubmitted => "✅ You've already submitted your guess!",
            Self::PlayerNotInRound => "❌ That player is not part of the current round.",
            Self::NotAuthorized => "🚫 Only group admins can do that.",
            Self::Storage(_) | Self::Render(_) => {
                "❌ Something went wrong on our side. Please try again."
            }
        }
    }
}
