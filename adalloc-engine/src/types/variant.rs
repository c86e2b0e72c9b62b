//! Bandit arms and their sufficient statistics

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AllocError, Result};

/// Longest accepted variant id, in bytes
pub const MAX_VARIANT_ID_LEN: usize = 128;

/// Prior pseudo-count for both alpha and beta; also their floor
pub const PRIOR: f64 = 1.0;

/// Identifier of an ad-creative variant
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VariantId(String);

impl VariantId {
    /// Validate and wrap an id
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(AllocError::Validation("variant id is empty".into()));
        }
        if id.len() > MAX_VARIANT_ID_LEN {
            return Err(AllocError::Validation(format!(
                "variant id exceeds {MAX_VARIANT_ID_LEN} bytes"
            )));
        }
        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
        {
            return Err(AllocError::Validation(format!(
                "variant id {id:?} contains invalid character {bad:?}"
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::borrow::Borrow<str> for VariantId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for VariantId {
    type Error = AllocError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<VariantId> for String {
    fn from(id: VariantId) -> Self {
        id.0
    }
}

impl std::str::FromStr for VariantId {
    type Err = AllocError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Optional outcome counters reported alongside an update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeMetrics {
    #[serde(default)]
    pub impressions: u64,
    #[serde(default)]
    pub clicks: u64,
    #[serde(default)]
    pub conversions: u64,
    #[serde(default)]
    pub revenue: f64,
}

impl OutcomeMetrics {
    pub fn with_revenue(revenue: f64) -> Self {
        Self {
            revenue,
            ..Default::default()
        }
    }
}

/// Check update inputs before any variant is touched
pub fn validate_update(reward: f64, cost: f64, metrics: Option<&OutcomeMetrics>) -> Result<()> {
    if !reward.is_finite() || !(0.0..=1.0).contains(&reward) {
        return Err(AllocError::Validation(format!(
            "reward must be within [0, 1], got {reward}"
        )));
    }
    if !cost.is_finite() || cost < 0.0 {
        return Err(AllocError::Validation(format!(
            "cost must be finite and non-negative, got {cost}"
        )));
    }
    if let Some(metrics) = metrics
        && (!metrics.revenue.is_finite() || metrics.revenue < 0.0)
    {
        return Err(AllocError::Validation(format!(
            "revenue must be finite and non-negative, got {}",
            metrics.revenue
        )));
    }
    Ok(())
}

/// A bandit arm with its Beta posterior and spend accounting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub alpha: f64,
    pub beta: f64,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub spend: f64,
    pub revenue: f64,
    pub roas: f64,
    /// Archived variants are left out of the default selection pool
    #[serde(default)]
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Variant {
    /// Fresh arm with a uniform prior and zero counters
    pub fn new(id: VariantId) -> Self {
        let now = Utc::now();
        Self {
            id,
            alpha: PRIOR,
            beta: PRIOR,
            impressions: 0,
            clicks: 0,
            conversions: 0,
            spend: 0.0,
            revenue: 0.0,
            roas: 0.0,
            archived: false,
            created_at: now,
            last_updated: now,
        }
    }

    /// Fold one outcome into the posterior.
    ///
    /// Inputs must already have passed [`validate_update`].
    pub(crate) fn apply_update(
        &mut self,
        reward: f64,
        cost: f64,
        metrics: Option<&OutcomeMetrics>,
    ) {
        self.alpha += reward;
        self.beta += 1.0 - reward;
        self.spend += cost;
        if let Some(metrics) = metrics {
            self.revenue += metrics.revenue;
            self.impressions = self.impressions.saturating_add(metrics.impressions);
            self.clicks = self.clicks.saturating_add(metrics.clicks);
            self.conversions = self.conversions.saturating_add(metrics.conversions);
        }
        self.clamp_and_refresh();
    }

    /// Discount historical evidence; alpha and beta never fall below the prior.
    pub(crate) fn apply_decay(&mut self, factor: f64) {
        self.alpha *= factor;
        self.beta *= factor;
        self.spend *= factor;
        self.revenue *= factor;
        self.clamp_and_refresh();
    }

    fn clamp_and_refresh(&mut self) {
        self.alpha = self.alpha.max(PRIOR);
        self.beta = self.beta.max(PRIOR);
        self.spend = self.spend.max(0.0);
        self.revenue = self.revenue.max(0.0);
        self.roas = compute_roas(self.revenue, self.spend);
        self.last_updated = Utc::now();
    }

    /// Expected success rate under the current posterior
    pub fn posterior_mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    pub fn stats(&self) -> VariantStats {
        VariantStats {
            variant_id: self.id.clone(),
            alpha: self.alpha,
            beta: self.beta,
            impressions: self.impressions,
            clicks: self.clicks,
            conversions: self.conversions,
            spend: self.spend,
            revenue: self.revenue,
            roas: self.roas,
            archived: self.archived,
            last_updated: self.last_updated,
        }
    }
}

/// Revenue over spend, zero when nothing has been spent
pub fn compute_roas(revenue: f64, spend: f64) -> f64 {
    if spend > 0.0 { revenue / spend } else { 0.0 }
}

/// Point-in-time view of a variant returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantStats {
    pub variant_id: VariantId,
    pub alpha: f64,
    pub beta: f64,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub spend: f64,
    pub revenue: f64,
    pub roas: f64,
    pub archived: bool,
    pub last_updated: DateTime<Utc>,
}
