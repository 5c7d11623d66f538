use crate::db::PostgresPool;
use crate::repo::RepoError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cineforge_common::model::{
    AssetRegistry, AssetScope, Character, CharacterId, Location, LocationId, Project,
    ProjectId, ProjectMetrics, ProjectStatus, Scene, SceneId, Storyboard,
};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct ProjectRecord {
    pub id: String,
    pub status: String,
    pub storyboard: Option<Value>,
    pub metadata: Value,
    pub audio_analysis: Option<Value>,
    pub metrics: Value,
    pub assets: Value,
    pub current_scene_index: i32,
    pub force_regenerate_scene_ids: Vec<String>,
    pub generation_rules: Vec<String>,
    pub generation_rules_history: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ProjectRecord> for Project {
    type Error = String;

    fn try_from(value: ProjectRecord) -> Result<Self, Self::Error> {
        let status = ProjectStatus::from_str(&value.status)
            .map_err(|_| format!("invalid project status: {}", value.status))?;
        let storyboard: Option<Storyboard> = value
            .storyboard
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| format!("invalid storyboard: {e}"))?;
        let metrics: ProjectMetrics = serde_json::from_value(value.metrics)
            .map_err(|e| format!("invalid metrics: {e}"))?;
        let assets: AssetRegistry = serde_json::from_value(value.assets)
            .map_err(|e| format!("invalid asset registry: {e}"))?;
        let generation_rules_history = serde_json::from_value(value.generation_rules_history)
            .map_err(|e| format!("invalid generation rules history: {e}"))?;
        Ok(Project {
            id: ProjectId(value.id),
            status,
            storyboard,
            metadata: value.metadata,
            audio_analysis: value.audio_analysis,
            metrics,
            assets,
            current_scene_index: value.current_scene_index,
            force_regenerate_scene_ids: value
                .force_regenerate_scene_ids
                .into_iter()
                .map(SceneId)
                .collect(),
            generation_rules: value.generation_rules,
            generation_rules_history,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

impl TryFrom<Project> for ProjectRecord {
    type Error = String;

    fn try_from(value: Project) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.0,
            status: value.status.to_string(),
            storyboard: value
                .storyboard
                .map(|s| serde_json::to_value(s).map_err(|e| e.to_string()))
                .transpose()?,
            metadata: value.metadata,
            audio_analysis: value.audio_analysis,
            metrics: serde_json::to_value(value.metrics).map_err(|e| e.to_string())?,
            assets: serde_json::to_value(value.assets).map_err(|e| e.to_string())?,
            current_scene_index: value.current_scene_index,
            force_regenerate_scene_ids: value
                .force_regenerate_scene_ids
                .into_iter()
                .map(|id| id.0)
                .collect(),
            generation_rules: value.generation_rules,
            generation_rules_history: serde_json::to_value(value.generation_rules_history)
                .map_err(|e| e.to_string())?,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct SceneRecord {
    pub id: String,
    pub project_id: String,
    pub scene_index: i32,
    pub title: String,
    pub description: String,
    pub start_time_seconds: Option<f64>,
    pub end_time_seconds: Option<f64>,
    pub location_id: Option<String>,
    pub assets: Value,
    #[sqlx(skip)]
    pub character_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SceneRecord> for Scene {
    type Error = String;

    fn try_from(value: SceneRecord) -> Result<Self, Self::Error> {
        let assets: AssetRegistry = serde_json::from_value(value.assets)
            .map_err(|e| format!("invalid asset registry: {e}"))?;
        Ok(Scene {
            id: SceneId(value.id),
            project_id: ProjectId(value.project_id),
            index: value.scene_index,
            title: value.title,
            description: value.description,
            start_time_seconds: value.start_time_seconds,
            end_time_seconds: value.end_time_seconds,
            character_ids: value.character_ids.into_iter().map(CharacterId).collect(),
            location_id: value.location_id.map(LocationId),
            assets,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

impl TryFrom<Scene> for SceneRecord {
    type Error = String;

    fn try_from(value: Scene) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.0,
            project_id: value.project_id.0,
            scene_index: value.index,
            title: value.title,
            description: value.description,
            start_time_seconds: value.start_time_seconds,
            end_time_seconds: value.end_time_seconds,
            location_id: value.location_id.map(|id| id.0),
            assets: serde_json::to_value(value.assets).map_err(|e| e.to_string())?,
            character_ids: value.character_ids.into_iter().map(|id| id.0).collect(),
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct CharacterRecord {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub description: String,
    pub assets: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<CharacterRecord> for Character {
    type Error = String;

    fn try_from(value: CharacterRecord) -> Result<Self, Self::Error> {
        let assets: AssetRegistry = serde_json::from_value(value.assets)
            .map_err(|e| format!("invalid asset registry: {e}"))?;
        Ok(Character {
            id: CharacterId(value.id),
            project_id: ProjectId(value.project_id),
            name: value.name,
            description: value.description,
            assets,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

impl TryFrom<Character> for CharacterRecord {
    type Error = String;

    fn try_from(value: Character) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.0,
            project_id: value.project_id.0,
            name: value.name,
            description: value.description,
            assets: serde_json::to_value(value.assets).map_err(|e| e.to_string())?,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct LocationRecord {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub description: String,
    pub assets: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<LocationRecord> for Location {
    type Error = String;

    fn try_from(value: LocationRecord) -> Result<Self, Self::Error> {
        let assets: AssetRegistry = serde_json::from_value(value.assets)
            .map_err(|e| format!("invalid asset registry: {e}"))?;
        Ok(Location {
            id: LocationId(value.id),
            project_id: ProjectId(value.project_id),
            name: value.name,
            description: value.description,
            assets,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

impl TryFrom<Location> for LocationRecord {
    type Error = String;

    fn try_from(value: Location) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.0,
            project_id: value.project_id.0,
            name: value.name,
            description: value.description,
            assets: serde_json::to_value(value.assets).map_err(|e| e.to_string())?,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[async_trait]
pub trait ProjectRepo: Send + Sync {
    async fn create(&self, record: ProjectRecord) -> Result<(), RepoError>;

    async fn get(&self, project_id: &str) -> Result<Option<ProjectRecord>, RepoError>;

    /// Full-row update by primary key; `false` when the project is gone.
    async fn update(&self, record: ProjectRecord) -> Result<bool, RepoError>;

    async fn upsert_scene(&self, record: SceneRecord) -> Result<(), RepoError>;

    async fn get_scene(&self, scene_id: &str) -> Result<Option<SceneRecord>, RepoError>;

    /// Scenes of a project ordered by index, with character links resolved.
    async fn get_scenes(&self, project_id: &str) -> Result<Vec<SceneRecord>, RepoError>;

    async fn upsert_character(&self, record: CharacterRecord) -> Result<(), RepoError>;

    async fn get_characters(&self, project_id: &str) -> Result<Vec<CharacterRecord>, RepoError>;

    async fn upsert_location(&self, record: LocationRecord) -> Result<(), RepoError>;

    async fn get_locations(&self, project_id: &str) -> Result<Vec<LocationRecord>, RepoError>;

    async fn link_scene_character(
        &self,
        scene_id: &str,
        character_id: &str,
    ) -> Result<(), RepoError>;

    /// Raw `assets` column of the aggregate the scope points at.
    async fn load_assets(&self, scope: &AssetScope) -> Result<Option<Value>, RepoError>;

    async fn store_assets(
        &self,
        scope: &AssetScope,
        assets: Value,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, RepoError>;
}

pub struct DbProjectRepo {
    db_pool: PostgresPool,
}

impl DbProjectRepo {
    pub fn new(db_pool: PostgresPool) -> Self {
        Self { db_pool }
    }

    async fn scene_character_ids(&self, scene_id: &str) -> Result<Vec<String>, RepoError> {
        let query = sqlx::query_as::<_, (String,)>(
            "SELECT character_id FROM scenes_to_characters WHERE scene_id = $1 ORDER BY character_id",
        )
        .bind(scene_id);
        let rows = self
            .db_pool
            .with_ro("project", "scene_character_ids")
            .fetch_all_as(query)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl ProjectRepo for DbProjectRepo {
    async fn create(&self, record: ProjectRecord) -> Result<(), RepoError> {
        let query = sqlx::query(
            r#"
              INSERT INTO projects
                (id, status, storyboard, metadata, audio_analysis, metrics, assets,
                 current_scene_index, force_regenerate_scene_ids, generation_rules,
                 generation_rules_history, created_at, updated_at)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&record.id)
        .bind(&record.status)
        .bind(&record.storyboard)
        .bind(&record.metadata)
        .bind(&record.audio_analysis)
        .bind(&record.metrics)
        .bind(&record.assets)
        .bind(record.current_scene_index)
        .bind(&record.force_regenerate_scene_ids)
        .bind(&record.generation_rules)
        .bind(&record.generation_rules_history)
        .bind(record.created_at)
        .bind(record.updated_at);
        self.db_pool.with_rw("project", "create").execute(query).await?;
        Ok(())
    }

    async fn get(&self, project_id: &str) -> Result<Option<ProjectRecord>, RepoError> {
        let query = sqlx::query_as::<_, ProjectRecord>("SELECT * FROM projects WHERE id = $1")
            .bind(project_id);
        self.db_pool
            .with_ro("project", "get")
            .fetch_optional_as(query)
            .await
    }

    async fn update(&self, record: ProjectRecord) -> Result<bool, RepoError> {
        let query = sqlx::query(
            r#"
              UPDATE projects
              SET status = $2,
                  storyboard = $3,
                  metadata = $4,
                  audio_analysis = $5,
                  metrics = $6,
                  assets = $7,
                  current_scene_index = $8,
                  force_regenerate_scene_ids = $9,
                  generation_rules = $10,
                  generation_rules_history = $11,
                  updated_at = $12
              WHERE id = $1
            "#,
        )
        .bind(&record.id)
        .bind(&record.status)
        .bind(&record.storyboard)
        .bind(&record.metadata)
        .bind(&record.audio_analysis)
        .bind(&record.metrics)
        .bind(&record.assets)
        .bind(record.current_scene_index)
        .bind(&record.force_regenerate_scene_ids)
        .bind(&record.generation_rules)
        .bind(&record.generation_rules_history)
        .bind(record.updated_at);
        let result = self.db_pool.with_rw("project", "update").execute(query).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn upsert_scene(&self, record: SceneRecord) -> Result<(), RepoError> {
        let query = sqlx::query(
            r#"
              INSERT INTO scenes
                (id, project_id, scene_index, title, description, start_time_seconds,
                 end_time_seconds, location_id, assets, created_at, updated_at)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
              ON CONFLICT (id) DO UPDATE
              SET scene_index = $3,
                  title = $4,
                  description = $5,
                  start_time_seconds = $6,
                  end_time_seconds = $7,
                  location_id = $8,
                  assets = $9,
                  updated_at = $11
            "#,
        )
        .bind(&record.id)
        .bind(&record.project_id)
        .bind(record.scene_index)
        .bind(&record.title)
        .bind(&record.description)
        .bind(record.start_time_seconds)
        .bind(record.end_time_seconds)
        .bind(&record.location_id)
        .bind(&record.assets)
        .bind(record.created_at)
        .bind(record.updated_at);
        self.db_pool.with_rw("project", "upsert_scene").execute(query).await?;

        for character_id in &record.character_ids {
            self.link_scene_character(&record.id, character_id).await?;
        }
        Ok(())
    }

    async fn get_scene(&self, scene_id: &str) -> Result<Option<SceneRecord>, RepoError> {
        let query =
            sqlx::query_as::<_, SceneRecord>("SELECT * FROM scenes WHERE id = $1").bind(scene_id);
        let record = self
            .db_pool
            .with_ro("project", "get_scene")
            .fetch_optional_as(query)
            .await?;
        match record {
            Some(mut record) => {
                record.character_ids = self.scene_character_ids(&record.id).await?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn get_scenes(&self, project_id: &str) -> Result<Vec<SceneRecord>, RepoError> {
        let query = sqlx::query_as::<_, SceneRecord>(
            "SELECT * FROM scenes WHERE project_id = $1 ORDER BY scene_index",
        )
        .bind(project_id);
        let mut records = self
            .db_pool
            .with_ro("project", "get_scenes")
            .fetch_all_as(query)
            .await?;
        for record in &mut records {
            record.character_ids = self.scene_character_ids(&record.id).await?;
        }
        Ok(records)
    }

    async fn upsert_character(&self, record: CharacterRecord) -> Result<(), RepoError> {
        let query = sqlx::query(
            r#"
              INSERT INTO characters
                (id, project_id, name, description, assets, created_at, updated_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7)
              ON CONFLICT (id) DO UPDATE
              SET name = $3, description = $4, assets = $5, updated_at = $7
            "#,
        )
        .bind(&record.id)
        .bind(&record.project_id)
        .bind(&record.name)
        .bind(&record.description)
        .bind(&record.assets)
        .bind(record.created_at)
        .bind(record.updated_at);
        self.db_pool
            .with_rw("project", "upsert_character")
            .execute(query)
            .await?;
        Ok(())
    }

    async fn get_characters(&self, project_id: &str) -> Result<Vec<CharacterRecord>, RepoError> {
        let query = sqlx::query_as::<_, CharacterRecord>(
            "SELECT * FROM characters WHERE project_id = $1 ORDER BY id",
        )
        .bind(project_id);
        self.db_pool
            .with_ro("project", "get_characters")
            .fetch_all_as(query)
            .await
    }

    async fn upsert_location(&self, record: LocationRecord) -> Result<(), RepoError> {
        let query = sqlx::query(
            r#"
              INSERT INTO locations
                (id, project_id, name, description, assets, created_at, updated_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7)
              ON CONFLICT (id) DO UPDATE
              SET name = $3, description = $4, assets = $5, updated_at = $7
            "#,
        )
        .bind(&record.id)
        .bind(&record.project_id)
        .bind(&record.name)
        .bind(&record.description)
        .bind(&record.assets)
        .bind(record.created_at)
        .bind(record.updated_at);
        self.db_pool
            .with_rw("project", "upsert_location")
            .execute(query)
            .await?;
        Ok(())
    }

    async fn get_locations(&self, project_id: &str) -> Result<Vec<LocationRecord>, RepoError> {
        let query = sqlx::query_as::<_, LocationRecord>(
            "SELECT * FROM locations WHERE project_id = $1 ORDER BY id",
        )
        .bind(project_id);
        self.db_pool
            .with_ro("project", "get_locations")
            .fetch_all_as(query)
            .await
    }

    async fn link_scene_character(
        &self,
        scene_id: &str,
        character_id: &str,
    ) -> Result<(), RepoError> {
        let query = sqlx::query(
            r#"
              INSERT INTO scenes_to_characters (scene_id, character_id)
              VALUES ($1, $2)
              ON CONFLICT DO NOTHING
            "#,
        )
        .bind(scene_id)
        .bind(character_id);
        self.db_pool
            .with_rw("project", "link_scene_character")
            .execute(query)
            .await?;
        Ok(())
    }

    async fn load_assets(&self, scope: &AssetScope) -> Result<Option<Value>, RepoError> {
        let (sql, id): (&str, &str) = match scope {
            AssetScope::Project(id) => ("SELECT assets FROM projects WHERE id = $1", id.as_str()),
            AssetScope::Scene(id) => ("SELECT assets FROM scenes WHERE id = $1", id.as_str()),
            AssetScope::Character(id) => {
                ("SELECT assets FROM characters WHERE id = $1", id.as_str())
            }
            AssetScope::Location(id) => {
                ("SELECT assets FROM locations WHERE id = $1", id.as_str())
            }
        };
        let rows = self
            .db_pool
            .with_ro("project", "load_assets")
            .fetch_optional_as(sqlx::query_as::<_, (Value,)>(sql).bind(id))
            .await?;
        Ok(rows.map(|(assets,)| assets))
    }

    async fn store_assets(
        &self,
        scope: &AssetScope,
        assets: Value,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let (sql, id): (&str, &str) = match scope {
            AssetScope::Project(id) => (
                "UPDATE projects SET assets = $2, updated_at = $3 WHERE id = $1",
                id.as_str(),
            ),
            AssetScope::Scene(id) => (
                "UPDATE scenes SET assets = $2, updated_at = $3 WHERE id = $1",
                id.as_str(),
            ),
            AssetScope::Character(id) => (
                "UPDATE characters SET assets = $2, updated_at = $3 WHERE id = $1",
                id.as_str(),
            ),
            AssetScope::Location(id) => (
                "UPDATE locations SET assets = $2, updated_at = $3 WHERE id = $1",
                id.as_str(),
            ),
        };
        let result = self
            .db_pool
            .with_rw("project", "store_assets")
            .execute(sqlx::query(sql).bind(id).bind(assets).bind(updated_at))
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Default)]
struct InMemoryProjectState {
    projects: HashMap<String, ProjectRecord>,
    scenes: HashMap<String, SceneRecord>,
    characters: HashMap<String, CharacterRecord>,
    locations: HashMap<String, LocationRecord>,
    scene_characters: BTreeSet<(String, String)>,
}

/// Hermetic twin of the Postgres repo.
#[derive(Default)]
pub struct InMemoryProjectRepo {
    state: Arc<Mutex<InMemoryProjectState>>,
}

impl InMemoryProjectRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectRepo for InMemoryProjectRepo {
    async fn create(&self, record: ProjectRecord) -> Result<(), RepoError> {
        let mut state = self.state.lock().await;
        if state.projects.contains_key(&record.id) {
            return Err(RepoError::UniqueViolation(format!(
                "project already exists: {}",
                record.id
            )));
        }
        state.projects.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, project_id: &str) -> Result<Option<ProjectRecord>, RepoError> {
        Ok(self.state.lock().await.projects.get(project_id).cloned())
    }

    async fn update(&self, record: ProjectRecord) -> Result<bool, RepoError> {
        let mut state = self.state.lock().await;
        if !state.projects.contains_key(&record.id) {
            return Ok(false);
        }
        state.projects.insert(record.id.clone(), record);
        Ok(true)
    }

    async fn upsert_scene(&self, record: SceneRecord) -> Result<(), RepoError> {
        let mut state = self.state.lock().await;
        for character_id in &record.character_ids {
            state
                .scene_characters
                .insert((record.id.clone(), character_id.clone()));
        }
        state.scenes.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_scene(&self, scene_id: &str) -> Result<Option<SceneRecord>, RepoError> {
        let state = self.state.lock().await;
        Ok(state.scenes.get(scene_id).cloned().map(|mut record| {
            record.character_ids = state
                .scene_characters
                .iter()
                .filter(|(scene, _)| scene == scene_id)
                .map(|(_, character)| character.clone())
                .collect();
            record
        }))
    }

    async fn get_scenes(&self, project_id: &str) -> Result<Vec<SceneRecord>, RepoError> {
        let state = self.state.lock().await;
        let mut records: Vec<SceneRecord> = state
            .scenes
            .values()
            .filter(|record| record.project_id == project_id)
            .cloned()
            .map(|mut record| {
                record.character_ids = state
                    .scene_characters
                    .iter()
                    .filter(|(scene, _)| *scene == record.id)
                    .map(|(_, character)| character.clone())
                    .collect();
                record
            })
            .collect();
        records.sort_by_key(|record| record.scene_index);
        Ok(records)
    }

    async fn upsert_character(&self, record: CharacterRecord) -> Result<(), RepoError> {
        self.state
            .lock()
            .await
            .characters
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_characters(&self, project_id: &str) -> Result<Vec<CharacterRecord>, RepoError> {
        let state = self.state.lock().await;
        let mut records: Vec<CharacterRecord> = state
            .characters
            .values()
            .filter(|record| record.project_id == project_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn upsert_location(&self, record: LocationRecord) -> Result<(), RepoError> {
        self.state
            .lock()
            .await
            .locations
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_locations(&self, project_id: &str) -> Result<Vec<LocationRecord>, RepoError> {
        let state = self.state.lock().await;
        let mut records: Vec<LocationRecord> = state
            .locations
            .values()
            .filter(|record| record.project_id == project_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn link_scene_character(
        &self,
        scene_id: &str,
        character_id: &str,
    ) -> Result<(), RepoError> {
        self.state
            .lock()
            .await
            .scene_characters
            .insert((scene_id.to_string(), character_id.to_string()));
        Ok(())
    }

    async fn load_assets(&self, scope: &AssetScope) -> Result<Option<Value>, RepoError> {
        let state = self.state.lock().await;
        Ok(match scope {
            AssetScope::Project(id) => state.projects.get(id.as_str()).map(|r| r.assets.clone()),
            AssetScope::Scene(id) => state.scenes.get(id.as_str()).map(|r| r.assets.clone()),
            AssetScope::Character(id) => {
                state.characters.get(id.as_str()).map(|r| r.assets.clone())
            }
            AssetScope::Location(id) => {
                state.locations.get(id.as_str()).map(|r| r.assets.clone())
            }
        })
    }

    async fn store_assets(
        &self,
        scope: &AssetScope,
        assets: Value,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let mut state = self.state.lock().await;
        Ok(match scope {
            AssetScope::Project(id) => match state.projects.get_mut(id.as_str()) {
                Some(record) => {
                    record.assets = assets;
                    record.updated_at = updated_at;
                    true
                }
                None => false,
            },
            AssetScope::Scene(id) => match state.scenes.get_mut(id.as_str()) {
                Some(record) => {
                    record.assets = assets;
                    record.updated_at = updated_at;
                    true
                }
                None => false,
            },
            AssetScope::Character(id) => match state.characters.get_mut(id.as_str()) {
                Some(record) => {
                    record.assets = assets;
                    record.updated_at = updated_at;
                    true
                }
                None => false,
            },
            AssetScope::Location(id) => match state.locations.get_mut(id.as_str()) {
                Some(record) => {
                    record.assets = assets;
                    record.updated_at = updated_at;
                    true
                }
                None => false,
            },
        })
    }
}
