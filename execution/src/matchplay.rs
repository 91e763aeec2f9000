//! Match rules evaluated against a room.
//!
//! ## Phases
//!
//! 1. **Waiting** - members join and toggle readiness
//! 2. **FullPendingReady** - capacity reached, members are prompted to ready up
//! 3. **Countdown** - every member (at least two) is ready; a one-shot timer is armed
//! 4. **Playing** - progress events update the scoreboard
//! 5. **Finished** - standings computed and the pot paid to rank one
//!
//! The only backwards edge is `Playing -> Waiting`, taken when a member leaves a normal
//! room mid-race. The countdown is never cancelled once armed.
//!
//! ## Ranking
//!
//! Articles completed (descending), then errors (ascending), then progress through the
//! current article (descending). Ties keep join order. In sudden-death rooms every
//! survivor ranks ahead of every eliminated player.

use crate::players::ConnectionRegistry;
use crate::rooms::Room;
use std::cmp::Ordering;
use typerace_types::{Phase, PlayerStatus, ScoreRow, Standing};

/// Why a match ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishReason {
    /// Every scoreboard row reports finished.
    AllFinished,
    /// Sudden death left at most one survivor.
    LastSurvivor,
    /// A client reported the race clock ran out.
    TimedOut,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::AllFinished => "all_finished",
            FinishReason::LastSurvivor => "last_survivor",
            FinishReason::TimedOut => "timed_out",
        }
    }
}

/// True when the room has more than one member and all of them are ready.
pub fn all_ready(room: &Room, players: &ConnectionRegistry) -> bool {
    room.len() > 1
        && room.members().iter().all(|id| {
            players
                .find(id)
                .is_some_and(|player| player.status == PlayerStatus::Ready)
        })
}

/// Phase a pre-match room should sit in given its current membership.
pub fn lobby_phase(room: &Room) -> Phase {
    if room.is_full() {
        Phase::FullPendingReady
    } else {
        Phase::Waiting
    }
}

/// Finish condition for a playing room, checked after any scoreboard or membership change.
pub fn finish_reason(room: &Room) -> Option<FinishReason> {
    if room.phase() != Phase::Playing || room.is_empty() {
        return None;
    }
    if room.mode().is_high_stakes() && room.survivors().count() <= 1 {
        return Some(FinishReason::LastSurvivor);
    }
    if room.scoreboard().iter().all(|row| row.finished) {
        return Some(FinishReason::AllFinished);
    }
    None
}

fn compare_rows(a: &ScoreRow, b: &ScoreRow) -> Ordering {
    b.articles_completed
        .cmp(&a.articles_completed)
        .then(a.error_count.cmp(&b.error_count))
        .then(
            b.current_article_progress
                .total_cmp(&a.current_article_progress),
        )
}

/// Ranked standings for the room's current scoreboard.
pub fn rank(room: &Room) -> Vec<Standing> {
    let mut rows: Vec<(bool, &ScoreRow)> = room
        .scoreboard()
        .iter()
        .map(|row| (room.is_eliminated(&row.connection_id), row))
        .collect();
    rows.sort_by(|(a_out, a), (b_out, b)| a_out.cmp(b_out).then_with(|| compare_rows(a, b)));
    rows.into_iter()
        .enumerate()
        .map(|(index, (eliminated, row))| Standing {
            rank: index + 1,
            eliminated,
            score: row.clone(),
        })
        .collect()
}
