use crate::model::{CharacterId, JobId, LocationId, ProjectId, SceneId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

/// Closed enumeration of the artifact kinds a pipeline produces.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AssetKind {
    EnhancedPrompt,
    Storyboard,
    AudioAnalysis,
    CharacterImage,
    LocationImage,
    SceneStartFrame,
    SceneEndFrame,
    SceneVideo,
    FrameQualityEvaluation,
    SceneQualityEvaluation,
    RenderedVideo,
    FinalOutput,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AssetType {
    Text,
    Image,
    Video,
    Json,
}

/// Which aggregate an asset history hangs off.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum AssetScope {
    Project(ProjectId),
    Character(CharacterId),
    Location(LocationId),
    Scene(SceneId),
}

impl Display for AssetScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Project(id) => write!(f, "project/{id}"),
            Self::Character(id) => write!(f, "character/{id}"),
            Self::Location(id) => write!(f, "location/{id}"),
            Self::Scene(id) => write!(f, "scene/{id}"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

/// One immutable entry of an asset history. Once appended, neither `data`
/// nor `metadata` changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetVersion {
    pub version: u32,
    pub data: String,
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    pub metadata: AssetMetadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AssetHistoryError {
    #[error("best pointer {requested} out of range, history has {len} versions")]
    BestOutOfRange { requested: u32, len: u32 },
}

/// Ordered, append-only versions of one artifact kind for one scope, plus a
/// movable `best` pointer. `best == 0` means "unset".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetHistory {
    #[serde(default)]
    pub versions: Vec<AssetVersion>,
    #[serde(default)]
    pub best: u32,
}

impl AssetHistory {
    pub fn next_version_number(&self) -> u32 {
        self.versions.len() as u32 + 1
    }

    /// Appends a new version, keeping numbering dense from 1.
    pub fn append(
        &mut self,
        data: String,
        asset_type: AssetType,
        metadata: AssetMetadata,
        created_at: DateTime<Utc>,
        set_as_best: bool,
    ) -> u32 {
        let version = self.next_version_number();
        self.versions.push(AssetVersion {
            version,
            data,
            asset_type,
            metadata,
            created_at,
        });
        if set_as_best {
            self.best = version;
        }
        version
    }

    pub fn best_version(&self) -> Option<&AssetVersion> {
        if self.best == 0 {
            None
        } else {
            self.versions.get(self.best as usize - 1)
        }
    }

    /// Moves `best`; `0` unsets it. Idempotent.
    pub fn set_best(&mut self, version: u32) -> Result<(), AssetHistoryError> {
        let len = self.versions.len() as u32;
        if version > len {
            return Err(AssetHistoryError::BestOutOfRange {
                requested: version,
                len,
            });
        }
        self.best = version;
        Ok(())
    }
}

/// Per-aggregate mapping from asset kind to its history. Serialized into the
/// `assets` JSON column of the owning row.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetRegistry {
    pub histories: HashMap<AssetKind, AssetHistory>,
}

impl AssetRegistry {
    pub fn history(&self, kind: AssetKind) -> Option<&AssetHistory> {
        self.histories.get(&kind)
    }

    pub fn history_mut(&mut self, kind: AssetKind) -> &mut AssetHistory {
        self.histories.entry(kind).or_default()
    }

    pub fn best_version(&self, kind: AssetKind) -> Option<&AssetVersion> {
        self.histories.get(&kind).and_then(AssetHistory::best_version)
    }

    pub fn has_best(&self, kind: AssetKind) -> bool {
        self.best_version(kind).is_some()
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use assert2::check;

    fn version_data(history: &AssetHistory) -> Vec<(u32, String)> {
        history
            .versions
            .iter()
            .map(|v| (v.version, v.data.clone()))
            .collect()
    }

    #[test]
    fn append_is_dense_from_one() {
        let mut history = AssetHistory::default();
        let now = Utc::now();
        let v1 = history.append(
            "gs://bucket/a".into(),
            AssetType::Video,
            AssetMetadata::default(),
            now,
            true,
        );
        let v2 = history.append(
            "gs://bucket/b".into(),
            AssetType::Video,
            AssetMetadata::default(),
            now,
            true,
        );
        check!(v1 == 1);
        check!(v2 == 2);
        check!(history.best == 2);
        check!(history.next_version_number() == 3);
    }

    #[test]
    fn append_preserves_earlier_versions() {
        let mut history = AssetHistory::default();
        let now = Utc::now();
        history.append("one".into(), AssetType::Text, AssetMetadata::default(), now, true);
        let before = version_data(&history);
        history.append("two".into(), AssetType::Text, AssetMetadata::default(), now, false);
        check!(version_data(&history)[..1] == before[..]);
        check!(history.best == 1);
    }

    #[test]
    fn best_zero_is_unset() {
        let mut history = AssetHistory::default();
        check!(history.best_version().is_none());
        history.append("x".into(), AssetType::Image, AssetMetadata::default(), Utc::now(), true);
        check!(history.best_version().map(|v| v.version) == Some(1));
        history.set_best(0).unwrap();
        check!(history.best_version().is_none());
    }

    #[test]
    fn best_stays_in_range() {
        let mut history = AssetHistory::default();
        history.append("x".into(), AssetType::Image, AssetMetadata::default(), Utc::now(), true);
        let err = history.set_best(5).unwrap_err();
        check!(err == AssetHistoryError::BestOutOfRange { requested: 5, len: 1 });
        check!(history.best == 1);
    }

    #[test]
    fn asset_kind_wire_format() {
        check!(AssetKind::SceneVideo.to_string() == "scene_video");
        check!("final_output".parse::<AssetKind>().unwrap() == AssetKind::FinalOutput);
    }
}
