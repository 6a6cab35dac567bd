use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classified transaction type as delivered by the transaction feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Transfer,
    Swap,
    Bridge,
    Shielded,
    Other,
}

impl<'de> Deserialize<'de> for TxType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from_str_loose(&s))
    }
}

impl TxType {
    /// Types tracked with their own counter and counted towards diversity.
    pub const TRACKED: [Self; 4] = [Self::Transfer, Self::Swap, Self::Bridge, Self::Shielded];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transfer => "transfer",
            Self::Swap => "swap",
            Self::Bridge => "bridge",
            Self::Shielded => "shielded",
            Self::Other => "other",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "transfer" => Self::Transfer,
            "swap" => Self::Swap,
            "bridge" => Self::Bridge,
            "shielded" => Self::Shielded,
            _ => Self::Other,
        }
    }

    /// Anything beyond a plain transfer counts as feature usage.
    pub fn is_feature(self) -> bool {
        matches!(self, Self::Swap | Self::Bridge | Self::Shielded)
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified transaction for one wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub wallet_id: String,
    pub txid: String,
    pub block_timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub tx_type: TxType,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub value: Decimal,
    #[serde(default)]
    pub fee: Decimal,
    #[serde(default)]
    pub counterparty_type: Option<String>,
    /// Set by the classifier when the transaction exercised a designated product feature.
    #[serde(default)]
    pub feature_flag: bool,
}

impl TransactionEvent {
    /// Key used for sequence complexity: the subtype when classified, otherwise the type.
    pub fn subtype_key(&self) -> String {
        match &self.subtype {
            Some(s) if !s.is_empty() => s.clone(),
            _ => self.tx_type.as_str().to_string(),
        }
    }

    pub fn is_feature_usage(&self) -> bool {
        self.feature_flag || self.tx_type.is_feature()
    }
}

/// Registry view of a wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletInfo {
    pub wallet_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub wallet_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CohortType {
    Weekly,
    Monthly,
}

impl CohortType {
    pub const ALL: [Self; 2] = [Self::Weekly, Self::Monthly];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Result<Self, crate::error::AnalyticsError> {
        match s {
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(crate::error::AnalyticsError::InvalidCohortType(
                other.to_string(),
            )),
        }
    }
}

/// Adoption stages in their strict order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelStage {
    Created,
    FirstTx,
    FeatureUsage,
    Recurring,
    HighValue,
}

impl FunnelStage {
    pub const ALL: [Self; 5] = [
        Self::Created,
        Self::FirstTx,
        Self::FeatureUsage,
        Self::Recurring,
        Self::HighValue,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::FirstTx => "first_tx",
            Self::FeatureUsage => "feature_usage",
            Self::Recurring => "recurring",
            Self::HighValue => "high_value",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreComponent {
    Retention,
    Adoption,
    Activity,
    Diversity,
}

impl ScoreComponent {
    pub const ALL: [Self; 4] = [
        Self::Retention,
        Self::Adoption,
        Self::Activity,
        Self::Diversity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retention => "retention",
            Self::Adoption => "adoption",
            Self::Activity => "activity",
            Self::Diversity => "diversity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    Healthy,
    AtRisk,
    Churn,
}

impl WalletStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::AtRisk => "at_risk",
            Self::Churn => "churn",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(Self::Healthy),
            "at_risk" => Some(Self::AtRisk),
            "churn" => Some(Self::Churn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// A ratio that may be undefined because its denominator was zero.
///
/// Serialized as a plain number, or the string `"insufficient_data"`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Ratio {
    Value(f64),
    InsufficientData(InsufficientData),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsufficientData {
    InsufficientData,
}

impl Ratio {
    pub const INSUFFICIENT: Self = Self::InsufficientData(InsufficientData::InsufficientData);

    pub fn of(numerator: f64, denominator: f64) -> Self {
        if denominator > 0.0 {
            Self::Value(numerator / denominator)
        } else {
            Self::INSUFFICIENT
        }
    }

    pub fn value(self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(v),
            Self::InsufficientData(_) => None,
        }
    }

    pub fn map(self, f: impl FnOnce(f64) -> f64) -> Self {
        match self {
            Self::Value(v) => Self::Value(f(v)),
            other @ Self::InsufficientData(_) => other,
        }
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{v:.4}"),
            Self::InsufficientData(_) => f.write_str("insufficient data"),
        }
    }
}
