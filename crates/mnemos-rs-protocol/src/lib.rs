//! Shared vocabulary for Mnemos: identifiers, memory categories, tiers, and
//! backend health states.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a memory record.
pub type RecordId = Uuid;
/// Reference to the persona a record is attributed to.
pub type PersonaId = String;

/// Memory category, fixed at creation; determines routing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    /// Short-lived scratch memory.
    Working,
    /// Events and experiences.
    Episodic,
    /// Durable facts and knowledge.
    Semantic,
    /// Durable how-to knowledge.
    Procedural,
}

impl MemoryCategory {
    /// All categories in declaration order.
    pub const ALL: [MemoryCategory; 4] = [
        MemoryCategory::Working,
        MemoryCategory::Episodic,
        MemoryCategory::Semantic,
        MemoryCategory::Procedural,
    ];

    /// Stable lowercase name used in storage and config.
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryCategory::Working => "working",
            MemoryCategory::Episodic => "episodic",
            MemoryCategory::Semantic => "semantic",
            MemoryCategory::Procedural => "procedural",
        }
    }

    /// Whether records of this category may be evicted automatically.
    pub fn is_short_lived(self) -> bool {
        matches!(self, MemoryCategory::Working | MemoryCategory::Episodic)
    }
}

impl fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown category or tier name.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct ParseNameError {
    kind: &'static str,
    value: String,
}

impl FromStr for MemoryCategory {
    type Err = ParseNameError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        MemoryCategory::ALL
            .into_iter()
            .find(|category| category.as_str() == value)
            .ok_or_else(|| ParseNameError {
                kind: "memory category",
                value: value.to_string(),
            })
    }
}

/// Storage tier participating in the hybrid store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// Low-latency volatile cache with TTLs.
    Cache,
    /// Similarity-search capable index.
    Vector,
    /// Durable source of truth.
    Durable,
}

impl TierKind {
    /// All tiers, fastest first.
    pub const ALL: [TierKind; 3] = [TierKind::Cache, TierKind::Vector, TierKind::Durable];

    /// Stable lowercase name used in config and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            TierKind::Cache => "cache",
            TierKind::Vector => "vector",
            TierKind::Durable => "durable",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TierKind {
    type Err = ParseNameError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        TierKind::ALL
            .into_iter()
            .find(|tier| tier.as_str() == value)
            .ok_or_else(|| ParseNameError {
                kind: "tier",
                value: value.to_string(),
            })
    }
}

/// Health reported by a backend adapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendHealth {
    /// Fully operational.
    #[default]
    Healthy,
    /// Operational but slow or partially impaired; still routed to.
    Degraded,
    /// Not usable; removed from routing until it recovers.
    Unavailable,
}

impl BackendHealth {
    /// Whether the tier should receive traffic.
    pub fn is_active(self) -> bool {
        !matches!(self, BackendHealth::Unavailable)
    }
}

impl fmt::Display for BackendHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendHealth::Healthy => "healthy",
            BackendHealth::Degraded => "degraded",
            BackendHealth::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::{BackendHealth, MemoryCategory, TierKind};
    use pretty_assertions::assert_eq;

    #[test]
    fn category_names_round_trip_through_from_str() {
        for category in MemoryCategory::ALL {
            assert_eq!(category.as_str().parse::<MemoryCategory>(), Ok(category));
        }
        assert!("archival".parse::<MemoryCategory>().is_err());
    }

    #[test]
    fn category_serializes_lowercase() {
        let value = serde_json::to_value(MemoryCategory::Procedural).expect("serialize");
        assert_eq!(value, serde_json::json!("procedural"));
    }

    #[test]
    fn only_working_and_episodic_are_short_lived() {
        let short_lived: Vec<_> = MemoryCategory::ALL
            .into_iter()
            .filter(|category| category.is_short_lived())
            .collect();
        assert_eq!(
            short_lived,
            vec![MemoryCategory::Working, MemoryCategory::Episodic]
        );
    }

    #[test]
    fn unavailable_tiers_are_inactive() {
        assert!(BackendHealth::Healthy.is_active());
        assert!(BackendHealth::Degraded.is_active());
        assert!(!BackendHealth::Unavailable.is_active());
        assert_eq!("vector".parse::<TierKind>(), Ok(TierKind::Vector));
    }
}
