//! Build and test metadata types
//!
//! The field names here (`builder`, `buildnum`, `started`, `info.task_id`,
//! `seq`, `failed`, `phase`) are part of the externally observable
//! contract: they appear in object-store metadata documents and must stay
//! compatible with other readers of the same data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which tier a build's chunks are served from.
///
/// Selected once at build creation and immutable afterwards. Builds on the
/// bucket tier are written to both tiers during the migration window but
/// read exclusively from the object store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    #[default]
    Primary,
    Bucket,
}

impl StorageTier {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageTier::Primary => "primary",
            StorageTier::Bucket => "bucket",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "bucket" => StorageTier::Bucket,
            _ => StorageTier::Primary,
        }
    }
}

/// Correlation metadata attached to a build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    /// ID of the external task that produced this build.
    #[serde(default)]
    pub task_id: String,
}

/// A CI build: the owner of the global log and of its tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    pub builder: String,
    pub buildnum: i64,

    /// Display name, `"{builder} #{buildnum}"` by convention.
    pub name: String,

    pub started: DateTime<Utc>,
    #[serde(default)]
    pub info: BuildInfo,

    /// Failed builds are exempt from retention.
    #[serde(default)]
    pub failed: bool,

    /// Monotonic chunk sequence counter for the global log.
    #[serde(default)]
    pub seq: i64,

    #[serde(default)]
    pub tier: StorageTier,
}

/// Correlation metadata attached to a test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestInfo {
    #[serde(default)]
    pub task_id: String,
}

/// A test within a build: the owner of its own scoped log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    pub id: String,
    pub build_id: String,

    /// Denormalized owning-build name, for display.
    #[serde(default)]
    pub build_name: String,

    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub phase: String,

    pub started: DateTime<Utc>,
    #[serde(default)]
    pub ended: Option<DateTime<Utc>>,

    #[serde(default)]
    pub info: TestInfo,
    #[serde(default)]
    pub failed: bool,

    /// Monotonic chunk sequence counter for this test's log.
    #[serde(default)]
    pub seq: i64,
}
