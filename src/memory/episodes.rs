//! Episode tracking and boundary detection.
//!
//! [`detect_boundary`] is a pure function over the prior episode and the
//! incoming event; [`track_event`] applies it against the `episodes` table,
//! closing the prior episode and recording a temporal link on each boundary.

use crate::error::{HindsightError, Result};
use crate::memory::types::{BoundaryReason, Episode};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

/// Default idle gap threshold: 45 minutes.
pub const DEFAULT_TIME_GAP_MS: i64 = 45 * 60 * 1000;

/// Phrases that force an episode boundary when present in the content hint.
const BOUNDARY_PHRASES: &[&str] = &[
    "new task",
    "switching to",
    "done with",
    "moving on to",
    "let's start",
];

/// Outcome of boundary detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryDecision {
    pub needs_new: bool,
    pub reason: Option<BoundaryReason>,
    /// Elapsed ms since the prior episode's last event; 0 when none exists.
    pub gap_ms: i64,
}

impl BoundaryDecision {
    fn none(gap_ms: i64) -> Self {
        Self {
            needs_new: false,
            reason: None,
            gap_ms,
        }
    }

    fn boundary(reason: BoundaryReason, gap_ms: i64) -> Self {
        Self {
            needs_new: true,
            reason: Some(reason),
            gap_ms,
        }
    }
}

/// Classify whether an incoming event starts a new episode.
///
/// Precedence is fixed and first-match-wins: initial, phrase boundary, scope
/// change, time gap. A gap of exactly the threshold does NOT trigger; one
/// millisecond past it does.
pub fn detect_boundary(
    last: Option<&Episode>,
    now: DateTime<Utc>,
    profile: &str,
    project: &str,
    session: &str,
    content_hint: Option<&str>,
    gap_threshold_ms: i64,
) -> BoundaryDecision {
    let last = match last {
        None => return BoundaryDecision::boundary(BoundaryReason::Initial, 0),
        Some(last) => last,
    };

    let gap_ms = DateTime::parse_from_rfc3339(&last.last_event_at)
        .map(|t| (now - t.with_timezone(&Utc)).num_milliseconds())
        .unwrap_or(0);

    if let Some(hint) = content_hint {
        let lowered = hint.to_lowercase();
        if BOUNDARY_PHRASES.iter().any(|p| lowered.contains(p)) {
            return BoundaryDecision::boundary(BoundaryReason::PhraseBoundary, gap_ms);
        }
    }

    if last.profile != profile || last.project != project || last.session != session {
        return BoundaryDecision::boundary(BoundaryReason::ScopeChange, gap_ms);
    }

    if gap_ms > gap_threshold_ms {
        return BoundaryDecision::boundary(BoundaryReason::TimeGap, gap_ms);
    }

    BoundaryDecision::none(gap_ms)
}

/// Apply an incoming event to the bank's episode timeline.
///
/// Returns the id of the episode the event belongs to and the boundary
/// reason when a new one was started.
pub fn track_event(
    conn: &Connection,
    bank_id: &str,
    profile: &str,
    project: &str,
    session: &str,
    now: DateTime<Utc>,
    content_hint: Option<&str>,
    gap_threshold_ms: i64,
) -> Result<(String, Option<BoundaryReason>)> {
    let last = latest_episode(conn, bank_id)?;
    let decision = detect_boundary(
        last.as_ref(),
        now,
        profile,
        project,
        session,
        content_hint,
        gap_threshold_ms,
    );
    let now_str = now.to_rfc3339();

    if let (false, Some(last)) = (decision.needs_new, &last) {
        conn.execute(
            "UPDATE episodes SET last_event_at = ?2, event_count = event_count + 1 WHERE id = ?1",
            params![last.id, now_str],
        )?;
        return Ok((last.id.clone(), None));
    }

    let reason = decision.reason.unwrap_or(BoundaryReason::Initial);
    let new_id = uuid::Uuid::now_v7().to_string();

    // The new episode row must exist before the link references it.
    conn.execute(
        "INSERT INTO episodes (id, bank_id, profile, project, session, start_at, last_event_at, event_count, boundary_reason) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 1, ?7)",
        params![new_id, bank_id, profile, project, session, now_str, reason.as_str()],
    )?;

    // Close the prior episode and link it forward.
    if let Some(prior) = &last {
        conn.execute(
            "UPDATE episodes SET end_at = ?2 WHERE id = ?1 AND end_at IS NULL",
            params![prior.id, prior.last_event_at],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO episode_links (from_episode, to_episode, reason, gap_ms) \
             VALUES (?1, ?2, ?3, ?4)",
            params![prior.id, new_id, reason.as_str(), decision.gap_ms],
        )?;
    }

    tracing::debug!(
        bank = bank_id,
        episode = %new_id,
        reason = %reason,
        gap_ms = decision.gap_ms,
        "episode boundary"
    );
    Ok((new_id, Some(reason)))
}

/// The bank's most recent episode by last event time, if any.
pub fn latest_episode(conn: &Connection, bank_id: &str) -> Result<Option<Episode>> {
    conn.query_row(
        "SELECT id, bank_id, profile, project, session, start_at, end_at, last_event_at, \
         event_count, boundary_reason \
         FROM episodes WHERE bank_id = ?1 ORDER BY last_event_at DESC, start_at DESC LIMIT 1",
        params![bank_id],
        |row| {
            Ok(Episode {
                id: row.get(0)?,
                bank_id: row.get(1)?,
                profile: row.get(2)?,
                project: row.get(3)?,
                session: row.get(4)?,
                start_at: row.get(5)?,
                end_at: row.get(6)?,
                last_event_at: row.get(7)?,
                event_count: row.get(8)?,
                boundary_reason: row.get(9)?,
            })
        },
    )
    .optional()
    .map_err(HindsightError::from)
}
