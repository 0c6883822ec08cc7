//! Controller configuration
//!
//! Every policy the engine cannot infer is a field here: the auto-enable
//! threshold, the cross-target priority rule, reflection bounds and backoff,
//! pool size and collaborator timeouts. Values load from TOML; missing keys
//! take defaults.

use crate::error::ConfigError;
use crate::snapshot::AnalysisDepth;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What a reflection attempt budget is counted against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptScope {
    /// All steps of a target share one budget
    #[default]
    PerTarget,
    /// Each failing step gets its own budget
    PerStep,
}

/// Delay inserted between consecutive reflection attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    #[default]
    None,
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        base_ms: u64,
        max_ms: u64,
    },
}

impl BackoffPolicy {
    /// Delay before the `attempt`-th (1-based) attempt of a loop
    ///
    /// The first attempt never waits.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match *self {
            BackoffPolicy::None => Duration::ZERO,
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffPolicy::Exponential { base_ms, max_ms } => {
                let shift = (attempt - 2).min(32);
                let delay = base_ms.saturating_mul(1u64 << shift);
                Duration::from_millis(delay.min(max_ms))
            }
        }
    }
}

/// `target` may not start before `after` has finished planning its turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingConstraint {
    pub target: String,
    pub after: String,
}

/// Cross-target ordering policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityRule {
    /// Keywords ranked first-to-last; a library matching an earlier keyword
    /// is scheduled earlier
    pub concerns: Vec<String>,
    /// Explicit pairwise ordering by library name
    pub after: Vec<OrderingConstraint>,
}

impl Default for PriorityRule {
    fn default() -> Self {
        Self {
            concerns: vec!["auth".to_string(), "security".to_string(), "crypto".to_string()],
            after: Vec::new(),
        }
    }
}

impl PriorityRule {
    /// Rank of the first concern contained in `library`; unmatched libraries
    /// rank last
    #[must_use]
    pub fn concern_rank(&self, library: &str) -> usize {
        let lower = library.to_lowercase();
        self.concerns
            .iter()
            .position(|c| !c.is_empty() && lower.contains(&c.to_lowercase()))
            .unwrap_or(self.concerns.len())
    }

    /// Add an ordering constraint
    #[must_use]
    pub fn with_after(mut self, target: impl Into<String>, after: impl Into<String>) -> Self {
        self.after.push(OrderingConstraint {
            target: target.into(),
            after: after.into(),
        });
        self
    }
}

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    /// Confidence at or above which discovered targets start enabled
    pub enable_threshold: f64,
    /// Reflection attempts allowed per budget scope
    pub max_attempts: u32,
    pub attempt_scope: AttemptScope,
    pub reflection_backoff: BackoffPolicy,
    pub priority: PriorityRule,
    /// Target workflows running at once
    pub max_active_targets: usize,
    /// Upper bound on any single collaborator call
    pub collaborator_timeout_ms: u64,
    pub analysis_depth: AnalysisDepth,
    /// Knowledge below this relevance does not produce rules
    pub min_relevance: f64,
    /// Extra selectors passed to every test run
    pub check_selectors: Vec<String>,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            enable_threshold: 0.7,
            max_attempts: 3,
            attempt_scope: AttemptScope::PerTarget,
            reflection_backoff: BackoffPolicy::None,
            priority: PriorityRule::default(),
            max_active_targets: 4,
            collaborator_timeout_ms: 30_000,
            analysis_depth: AnalysisDepth::QuickScan,
            min_relevance: 0.0,
            check_selectors: Vec::new(),
        }
    }
}

impl PilotConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With auto-enable threshold
    #[inline]
    #[must_use]
    pub fn with_enable_threshold(mut self, threshold: f64) -> Self {
        self.enable_threshold = threshold;
        self
    }

    /// With reflection attempt bound
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// With attempt budget scope
    #[inline]
    #[must_use]
    pub fn with_attempt_scope(mut self, scope: AttemptScope) -> Self {
        self.attempt_scope = scope;
        self
    }

    /// With reflection backoff
    #[inline]
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.reflection_backoff = backoff;
        self
    }

    /// With cross-target priority rule
    #[inline]
    #[must_use]
    pub fn with_priority(mut self, priority: PriorityRule) -> Self {
        self.priority = priority;
        self
    }

    /// With pool size
    #[inline]
    #[must_use]
    pub fn with_max_active_targets(mut self, max: usize) -> Self {
        self.max_active_targets = max;
        self
    }

    /// With collaborator timeout
    #[inline]
    #[must_use]
    pub fn with_collaborator_timeout(mut self, timeout: Duration) -> Self {
        self.collaborator_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With analyzer depth
    #[inline]
    #[must_use]
    pub fn with_analysis_depth(mut self, depth: AnalysisDepth) -> Self {
        self.analysis_depth = depth;
        self
    }

    /// With minimum knowledge relevance
    #[inline]
    #[must_use]
    pub fn with_min_relevance(mut self, min: f64) -> Self {
        self.min_relevance = min;
        self
    }

    /// Collaborator timeout as a `Duration`
    #[inline]
    #[must_use]
    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    /// `ConfigError::Parse` for bad TOML, `ConfigError::Invalid` for values
    /// out of range.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    ///
    /// # Errors
    /// `ConfigError::Read` if the file cannot be read, otherwise as
    /// [`PilotConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Render as TOML
    ///
    /// # Errors
    /// Serialization failure.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Check value ranges
    ///
    /// # Errors
    /// `ConfigError::Invalid` naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.enable_threshold) {
            return Err(ConfigError::Invalid(format!(
                "enable_threshold must be within [0, 1], got {}",
                self.enable_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.min_relevance) {
            return Err(ConfigError::Invalid(format!(
                "min_relevance must be within [0, 1], got {}",
                self.min_relevance
            )));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".to_string()));
        }
        if self.max_active_targets == 0 {
            return Err(ConfigError::Invalid("max_active_targets must be at least 1".to_string()));
        }
        if self.collaborator_timeout_ms == 0 {
            return Err(ConfigError::Invalid("collaborator_timeout_ms must be positive".to_string()));
        }
        if let BackoffPolicy::Exponential { base_ms, max_ms } = self.reflection_backoff {
            if max_ms < base_ms {
                return Err(ConfigError::Invalid(
                    "reflection_backoff.max_ms must not be below base_ms".to_string(),
                ));
            }
        }
        for constraint in &self.priority.after {
            if constraint.target.eq_ignore_ascii_case(&constraint.after) {
                return Err(ConfigError::Invalid(format!(
                    "priority constraint orders {} after itself",
                    constraint.target
                )));
            }
        }
        Ok(())
    }
}
