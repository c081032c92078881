//! Core memory type definitions.
//!
//! Defines [`FactType`] (the four memory-unit categories), [`LinkType`]
//! (edge kinds between units), [`BoundaryReason`] (why an episode started),
//! and the record structs matching the memory schema.

use serde::{Deserialize, Serialize};

/// The four fact types a memory unit can carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    #[default]
    /// Stable facts about the world.
    World,
    /// First-person events and experiences.
    Experience,
    /// Subjective judgements and preferences.
    Opinion,
    /// Observations about the current context.
    Observation,
}

impl FactType {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::World => "world",
            Self::Experience => "experience",
            Self::Opinion => "opinion",
            Self::Observation => "observation",
        }
    }
}

impl std::fmt::Display for FactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "world" => Ok(Self::World),
            "experience" => Ok(Self::Experience),
            "opinion" => Ok(Self::Opinion),
            "observation" => Ok(Self::Observation),
            _ => Err(format!("unknown fact type: {s}")),
        }
    }
}

/// Typed edge kinds between memory units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Temporal,
    Semantic,
    Entity,
    Causes,
    CausedBy,
    Enables,
    Prevents,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Temporal => "temporal",
            Self::Semantic => "semantic",
            Self::Entity => "entity",
            Self::Causes => "causes",
            Self::CausedBy => "caused_by",
            Self::Enables => "enables",
            Self::Prevents => "prevents",
        }
    }
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LinkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temporal" => Ok(Self::Temporal),
            "semantic" => Ok(Self::Semantic),
            "entity" => Ok(Self::Entity),
            "causes" => Ok(Self::Causes),
            "caused_by" => Ok(Self::CausedBy),
            "enables" => Ok(Self::Enables),
            "prevents" => Ok(Self::Prevents),
            _ => Err(format!("unknown link type: {s}")),
        }
    }
}

/// Why an episode boundary was drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryReason {
    /// First episode in this scope.
    Initial,
    /// A boundary phrase ("new task", "switching to", ...) in the content.
    PhraseBoundary,
    /// Profile, project, or session differs from the prior episode.
    ScopeChange,
    /// Idle gap longer than the configured threshold.
    TimeGap,
}

impl BoundaryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::PhraseBoundary => "phrase_boundary",
            Self::ScopeChange => "scope_change",
            Self::TimeGap => "time_gap",
        }
    }
}

impl std::fmt::Display for BoundaryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A memory unit, matching the `memory_units` table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryUnit {
    /// UUID v7 (time-sortable) primary key.
    pub id: String,
    pub bank_id: String,
    pub content: String,
    pub fact_type: FactType,
    /// Confidence score in `[0.0, 1.0]`.
    pub confidence: f64,
    /// When the described fact started, if known.
    pub occurred_start: Option<String>,
    /// When the described fact ended, if known.
    pub occurred_end: Option<String>,
    /// When the fact was mentioned to us.
    pub mentioned_at: Option<String>,
    /// Number of times this unit has been returned from recall.
    pub access_count: u32,
    pub last_accessed: Option<String>,
    /// Consolidation strength in `[0.0, 3.0]`; bumped +0.02 per recall hit.
    pub encoding_strength: f64,
    /// How many observations support this unit (bumped on dedup hits).
    pub proof_count: u32,
    /// IDs of units consolidated into this one.
    pub source_memory_ids: Vec<String>,
    /// Structured change history; unknown shapes are preserved opaquely.
    pub history: Vec<HistoryEntry>,
    pub created_at: String,
    pub updated_at: String,
}

/// One entry in a memory unit's change history.
///
/// Known shapes get explicit variants; anything else round-trips through
/// `Unknown` so forward-compatibility never loses data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntry {
    Created { at: String },
    Reinforced { at: String, proof_count: u32 },
    Consolidated { at: String, merged_ids: Vec<String> },
    #[serde(untagged)]
    Unknown(serde_json::Value),
}

/// An entity referenced by memory units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub bank_id: String,
    pub name: String,
    pub entity_type: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A bounded timeline segment scoped by (profile, project, session).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub bank_id: String,
    pub profile: String,
    pub project: String,
    pub session: String,
    pub start_at: String,
    pub end_at: Option<String>,
    pub last_event_at: String,
    pub event_count: u32,
    pub boundary_reason: String,
}

/// A typed weighted edge between two memory units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLink {
    pub source_id: String,
    pub target_id: String,
    pub link_type: LinkType,
    pub weight: f64,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fact_type_round_trips_through_strings() {
        for ft in [
            FactType::World,
            FactType::Experience,
            FactType::Opinion,
            FactType::Observation,
        ] {
            assert_eq!(ft.as_str().parse::<FactType>().unwrap(), ft);
        }
        assert!("feeling".parse::<FactType>().is_err());
    }

    #[test]
    fn link_type_round_trips_through_strings() {
        assert_eq!("caused_by".parse::<LinkType>().unwrap(), LinkType::CausedBy);
        assert_eq!(LinkType::Prevents.as_str(), "prevents");
        assert!("related".parse::<LinkType>().is_err());
    }

    #[test]
    fn unknown_history_shapes_are_preserved() {
        let raw = r#"[{"kind":"created","at":"2026-01-01T00:00:00Z"},{"legacy_field":42}]"#;
        let entries: Vec<HistoryEntry> = serde_json::from_str(raw).unwrap();
        assert!(matches!(entries[0], HistoryEntry::Created { .. }));
        match &entries[1] {
            HistoryEntry::Unknown(value) => assert_eq!(value["legacy_field"], 42),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }
}
