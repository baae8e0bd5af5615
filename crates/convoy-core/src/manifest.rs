//! The declarative deployment manifest.
//!
//! A manifest describes what to deploy (artifacts), to whom (selector) and
//! how (strategy). Parsing and validation live in `convoy-manifest`; this
//! module holds the data model shared by the parser, the store and the
//! engine.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::selector::Selector;

pub const API_VERSIONS: &[&str] = &["fleet/v1", "fleet.v1"];
pub const KIND_DEPLOYMENT: &str = "Deployment";

/// A parsed deployment manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: ManifestSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSpec {
    #[serde(default)]
    pub selector: Selector,
    #[serde(default)]
    pub strategy: StrategySpec,
    pub template: Template,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub spec: TemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_deploy: Option<Hook>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_deploy: Option<Hook>,
}

/// A versioned software artifact to deliver to each device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(rename = "type", default)]
    pub artifact_type: String,
    /// Install path on the device.
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// An integer count or a percentage of the fleet, e.g. `3` or `"25%"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PercentOrInt {
    Count(u32),
    Percent(u32),
}

impl PercentOrInt {
    /// Resolve against a population of `total` devices. Percentages round up.
    pub fn resolve(&self, total: usize) -> usize {
        match self {
            PercentOrInt::Count(n) => *n as usize,
            PercentOrInt::Percent(p) => (total * *p as usize).div_ceil(100),
        }
    }

    pub fn is_percent(&self) -> bool {
        matches!(self, PercentOrInt::Percent(_))
    }

    pub fn value(&self) -> u32 {
        match self {
            PercentOrInt::Count(n) | PercentOrInt::Percent(n) => *n,
        }
    }
}

impl std::fmt::Display for PercentOrInt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PercentOrInt::Count(n) => write!(f, "{}", n),
            PercentOrInt::Percent(p) => write!(f, "{}%", p),
        }
    }
}

impl Serialize for PercentOrInt {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PercentOrInt::Count(n) => serializer.serialize_u32(*n),
            PercentOrInt::Percent(p) => serializer.serialize_str(&format!("{}%", p)),
        }
    }
}

impl<'de> Deserialize<'de> for PercentOrInt {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Count(n) => Ok(PercentOrInt::Count(n)),
            Raw::Text(s) => {
                let trimmed = s.trim();
                let (digits, percent) = match trimmed.strip_suffix('%') {
                    Some(digits) => (digits.trim(), true),
                    None => (trimmed, false),
                };
                let value: u32 = digits.parse().map_err(|_| {
                    serde::de::Error::custom(format!(
                        "expected an integer or a percentage like \"25%\", got {:?}",
                        s
                    ))
                })?;
                Ok(if percent {
                    PercentOrInt::Percent(value)
                } else {
                    PercentOrInt::Count(value)
                })
            }
        }
    }
}

/// The strategy block as authored: a `type` tag plus the nested config
/// matching it. Mismatched shapes are rejected during validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategySpec {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub strategy_type: Option<StrategyType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdateConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanaryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blue_green: Option<BlueGreenConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyType {
    RollingUpdate,
    Canary,
    BlueGreen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateConfig {
    #[serde(default = "default_quarter")]
    pub max_unavailable: PercentOrInt,
    #[serde(default = "default_quarter")]
    pub max_surge: PercentOrInt,
    /// Pause between batches.
    #[serde(default, with = "duration")]
    pub wait_time: Duration,
    #[serde(default, with = "duration")]
    pub health_timeout: Duration,
}

impl Default for RollingUpdateConfig {
    fn default() -> Self {
        Self {
            max_unavailable: default_quarter(),
            max_surge: default_quarter(),
            wait_time: Duration::ZERO,
            health_timeout: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryConfig {
    #[serde(default)]
    pub steps: Vec<CanaryStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisConfig>,
    #[serde(default)]
    pub require_approval: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryStep {
    /// Cumulative share of the fleet in (0, 100]; the final step must be 100.
    pub weight: u32,
    /// Bake time after the step's campaign completes.
    #[serde(default, with = "duration")]
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub metrics: Vec<String>,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueGreenConfig {
    #[serde(default = "default_true")]
    pub auto_promote: bool,
    #[serde(default = "default_promote_timeout", with = "duration")]
    pub promote_timeout: Duration,
    #[serde(default, with = "duration")]
    pub scale_down_delay: Duration,
}

impl Default for BlueGreenConfig {
    fn default() -> Self {
        Self {
            auto_promote: true,
            promote_timeout: default_promote_timeout(),
            scale_down_delay: Duration::ZERO,
        }
    }
}

/// The resolved rollout strategy, persisted alongside the deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Strategy {
    RollingUpdate(RollingUpdateConfig),
    Canary(CanaryConfig),
    BlueGreen(BlueGreenConfig),
}

impl Strategy {
    /// Resolve the authored strategy block into a concrete strategy.
    ///
    /// The nested config must match the `type` tag; a config without its tag
    /// (or under a different tag) is a mismatched shape. An entirely empty
    /// block defaults to a 25%/25% rolling update.
    pub fn from_spec(spec: &StrategySpec) -> Result<Strategy, String> {
        let configs = [
            ("rollingUpdate", spec.rolling_update.is_some()),
            ("canary", spec.canary.is_some()),
            ("blueGreen", spec.blue_green.is_some()),
        ];

        let expected = match spec.strategy_type {
            None => {
                if let Some((name, _)) = configs.iter().find(|(_, present)| *present) {
                    return Err(format!("strategy config {} given without a type", name));
                }
                return Ok(Strategy::RollingUpdate(RollingUpdateConfig::default()));
            }
            Some(StrategyType::RollingUpdate) => "rollingUpdate",
            Some(StrategyType::Canary) => "canary",
            Some(StrategyType::BlueGreen) => "blueGreen",
        };

        if let Some((name, _)) = configs
            .iter()
            .find(|(name, present)| *present && *name != expected)
        {
            return Err(format!(
                "strategy config {} does not match type {:?}",
                name,
                spec.strategy_type.unwrap()
            ));
        }

        Ok(match spec.strategy_type.unwrap() {
            StrategyType::RollingUpdate => {
                Strategy::RollingUpdate(spec.rolling_update.clone().unwrap_or_default())
            }
            StrategyType::Canary => Strategy::Canary(spec.canary.clone().unwrap_or_default()),
            StrategyType::BlueGreen => {
                Strategy::BlueGreen(spec.blue_green.clone().unwrap_or_default())
            }
        })
    }
}

/// Health probe executed on the device after an update lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_get: Option<HttpGetCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_socket: Option<TcpSocketCheck>,
    #[serde(default, with = "duration")]
    pub initial_delay: Duration,
    #[serde(default = "default_period", with = "duration")]
    pub period: Duration,
    #[serde(default = "default_check_timeout", with = "duration")]
    pub timeout: Duration,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpGetCheck {
    pub path: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecCheck {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpSocketCheck {
    pub port: u16,
}

/// A command run on the device before or after artifact installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    #[serde(default)]
    pub name: String,
    pub command: Vec<String>,
    #[serde(default, with = "duration")]
    pub timeout: Duration,
}

fn default_quarter() -> PercentOrInt {
    PercentOrInt::Percent(25)
}

fn default_true() -> bool {
    true
}

fn default_promote_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_period() -> Duration {
    Duration::from_secs(10)
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_failure_threshold() -> u32 {
    3
}

/// Serde helper for durations written as `500ms`, `30s`, `5m`, `2h`, or a
/// bare number of seconds.
pub mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse(&s).map_err(serde::de::Error::custom),
        }
    }

    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("duration {:?} is missing a unit", s))?;
        let (digits, unit) = s.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration: {:?}", s))?;
        match unit {
            "ms" => Ok(Duration::from_millis(value)),
            "s" => Ok(Duration::from_secs(value)),
            "m" => Ok(Duration::from_secs(value * 60)),
            "h" => Ok(Duration::from_secs(value * 3600)),
            _ => Err(format!("unknown duration unit {:?} in {:?}", unit, s)),
        }
    }

    pub fn format(d: &Duration) -> String {
        let millis = d.as_millis();
        if millis % 1000 != 0 {
            return format!("{}ms", millis);
        }
        let secs = d.as_secs();
        if secs >= 3600 && secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs >= 60 && secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }
}
