use crate::model::{
    AssetRegistry, CharacterId, LocationId, ProjectId, ProjectStatus, SceneId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A storyboard as produced by the storyboard-generation stage. Stored on
/// the project row; scene rows are materialized from it afterwards.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Storyboard {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub scenes: Vec<StoryboardScene>,
}

impl Storyboard {
    pub fn has_scenes(&self) -> bool {
        !self.scenes.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoryboardScene {
    pub id: SceneId,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub characters: Vec<CharacterId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationId>,
}

/// Snapshot of pipeline counters kept on the project row. Purely
/// informational; never consulted for control flow.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetrics {
    #[serde(default)]
    pub jobs_created: u64,
    #[serde(default)]
    pub jobs_completed: u64,
    #[serde(default)]
    pub jobs_failed: u64,
    #[serde(default)]
    pub scenes_completed: u64,
    #[serde(default)]
    pub interventions: u64,
}

/// One entry of `generation_rules_history`: the rule set as it stood after
/// a semantic-analysis pass, with the timestamp of the change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationRulesRevision {
    pub rules: Vec<String>,
    pub changed_at: DateTime<Utc>,
}

/// The top-level aggregate. Created once, mutated only under the project
/// lock, never deleted by the control plane.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub status: ProjectStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storyboard: Option<Storyboard>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_analysis: Option<Value>,
    #[serde(default)]
    pub metrics: ProjectMetrics,
    #[serde(default)]
    pub assets: AssetRegistry,
    #[serde(default)]
    pub current_scene_index: i32,
    #[serde(default)]
    pub force_regenerate_scene_ids: Vec<SceneId>,
    #[serde(default)]
    pub generation_rules: Vec<String>,
    #[serde(default)]
    pub generation_rules_history: Vec<GenerationRulesRevision>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(id: ProjectId, metadata: Value, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: ProjectStatus::Pending,
            storyboard: None,
            metadata,
            audio_analysis: None,
            metrics: ProjectMetrics::default(),
            assets: AssetRegistry::default(),
            current_scene_index: 0,
            force_regenerate_scene_ids: Vec::new(),
            generation_rules: Vec::new(),
            generation_rules_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn storyboard_has_scenes(&self) -> bool {
        self.storyboard
            .as_ref()
            .map(Storyboard::has_scenes)
            .unwrap_or(false)
    }

    /// Replaces the generation rules, recording the previous revision.
    pub fn update_generation_rules(&mut self, rules: Vec<String>, now: DateTime<Utc>) {
        if self.generation_rules == rules {
            return;
        }
        self.generation_rules_history.push(GenerationRulesRevision {
            rules: self.generation_rules.clone(),
            changed_at: now,
        });
        self.generation_rules = rules;
    }
}

/// Child of a project carrying its own asset registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: SceneId,
    pub project_id: ProjectId,
    pub index: i32,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time_seconds: Option<f64>,
    #[serde(default)]
    pub character_ids: Vec<CharacterId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<LocationId>,
    #[serde(default)]
    pub assets: AssetRegistry,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: CharacterId,
    pub project_id: ProjectId,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub assets: AssetRegistry,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub project_id: ProjectId,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub assets: AssetRegistry,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use assert2::check;

    #[test]
    fn generation_rules_update_records_history() {
        let now = Utc::now();
        let mut project = Project::new(ProjectId::from("P1"), Value::Null, now);
        project.update_generation_rules(vec!["no text overlays".into()], now);
        check!(project.generation_rules.len() == 1);
        check!(project.generation_rules_history.len() == 1);
        check!(project.generation_rules_history[0].rules.is_empty());

        // Same rules again: no new revision.
        project.update_generation_rules(vec!["no text overlays".into()], now);
        check!(project.generation_rules_history.len() == 1);
    }
}
