//! Category routing table.

use crate::error::ValidationError;
use mnemos_rs_protocol::{MemoryCategory, TierKind};
use std::time::Duration;

/// Where records of one category are read from and written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Tier consulted first on reads.
    pub primary: TierKind,
    /// Tiers every write fans out to.
    pub write: Vec<TierKind>,
    /// Cache TTL, also the window in which a working record may be consolidated.
    pub cache_ttl: Option<Duration>,
}

impl Route {
    pub fn new(primary: TierKind, write: impl Into<Vec<TierKind>>, cache_ttl: Option<Duration>) -> Self {
        Self {
            primary,
            write: write.into(),
            cache_ttl,
        }
    }

    pub fn writes_to(&self, tier: TierKind) -> bool {
        self.write.contains(&tier)
    }

    fn validate(&self, category: MemoryCategory) -> Result<(), ValidationError> {
        let invalid = |reason| ValidationError::InvalidRoute { category, reason };
        if !self.writes_to(TierKind::Durable) {
            return Err(invalid("write set must include the durable tier"));
        }
        if !self.writes_to(self.primary) {
            return Err(invalid("primary tier must be in the write set"));
        }
        if self.cache_ttl.is_some() && !self.writes_to(TierKind::Cache) {
            return Err(invalid("cache ttl requires the cache tier in the write set"));
        }
        Ok(())
    }
}

/// Routing table with one row per category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPolicy {
    working: Route,
    episodic: Route,
    semantic: Route,
    procedural: Route,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        let hot = [TierKind::Cache, TierKind::Vector, TierKind::Durable];
        let indexed = [TierKind::Vector, TierKind::Durable];
        Self {
            working: Route::new(TierKind::Cache, hot, Some(Duration::from_secs(60 * 60))),
            episodic: Route::new(TierKind::Cache, hot, Some(Duration::from_secs(24 * 60 * 60))),
            semantic: Route::new(TierKind::Vector, indexed, None),
            procedural: Route::new(TierKind::Vector, indexed, None),
        }
    }
}

impl RoutingPolicy {
    /// Build a validated table from explicit rows.
    pub fn new(
        working: Route,
        episodic: Route,
        semantic: Route,
        procedural: Route,
    ) -> Result<Self, ValidationError> {
        let policy = Self {
            working,
            episodic,
            semantic,
            procedural,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Replace one row, validating the result.
    pub fn with_route(mut self, category: MemoryCategory, route: Route) -> Result<Self, ValidationError> {
        route.validate(category)?;
        *self.route_mut(category) = route;
        Ok(self)
    }

    pub fn route(&self, category: MemoryCategory) -> &Route {
        match category {
            MemoryCategory::Working => &self.working,
            MemoryCategory::Episodic => &self.episodic,
            MemoryCategory::Semantic => &self.semantic,
            MemoryCategory::Procedural => &self.procedural,
        }
    }

    fn route_mut(&mut self, category: MemoryCategory) -> &mut Route {
        match category {
            MemoryCategory::Working => &mut self.working,
            MemoryCategory::Episodic => &mut self.episodic,
            MemoryCategory::Semantic => &mut self.semantic,
            MemoryCategory::Procedural => &mut self.procedural,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for category in MemoryCategory::ALL {
            self.route(category).validate(category)?;
        }
        Ok(())
    }

    /// Categories whose writes reach the vector tier.
    pub fn indexed_categories(&self) -> Vec<MemoryCategory> {
        MemoryCategory::ALL
            .into_iter()
            .filter(|category| self.route(*category).writes_to(TierKind::Vector))
            .collect()
    }

    /// Whether every category in `categories` is present in the vector tier.
    pub fn fully_indexed(&self, categories: &[MemoryCategory]) -> bool {
        categories
            .iter()
            .all(|category| self.route(*category).writes_to(TierKind::Vector))
    }
}
