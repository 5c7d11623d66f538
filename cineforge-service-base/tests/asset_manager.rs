use test_r::test;

use crate::seeded_project_repo;
use assert2::check;
use cineforge_common::model::{
    AssetKind, AssetMetadata, AssetScope, AssetType, ProjectId, SceneId,
};
use cineforge_service_base::service::asset::{
    AssetError, AssetManager, AssetManagerDefault, NewAssetVersion,
};

fn video(data: &str) -> NewAssetVersion {
    NewAssetVersion {
        data: data.to_string(),
        asset_type: AssetType::Video,
        metadata: AssetMetadata::default(),
    }
}

#[test]
async fn versions_are_dense_and_append_only() {
    let project_id = ProjectId::from("P1");
    let repo = seeded_project_repo(&project_id).await;
    let manager = AssetManagerDefault::new(repo);
    let scope = AssetScope::Scene(SceneId::from("S1"));

    check!(manager.next_version_number(&scope, AssetKind::SceneVideo).await.unwrap() == 1);

    let first = manager
        .create_versioned_assets(&scope, AssetKind::SceneVideo, vec![video("gs://b/v1")], true)
        .await
        .unwrap();
    check!(first == vec![1]);

    let second = manager
        .create_versioned_assets(&scope, AssetKind::SceneVideo, vec![video("gs://b/v2")], true)
        .await
        .unwrap();
    check!(second == vec![2]);

    let registry = manager.registry(&scope).await.unwrap();
    let history = registry.history(AssetKind::SceneVideo).unwrap();
    check!(history.versions.len() == 2);
    check!(history.versions[0].data == "gs://b/v1");
    check!(history.versions[1].data == "gs://b/v2");
    check!(history.best == 2);
}

#[test]
async fn set_as_best_false_keeps_the_pointer() {
    let project_id = ProjectId::from("P1");
    let repo = seeded_project_repo(&project_id).await;
    let manager = AssetManagerDefault::new(repo);
    let scope = AssetScope::Scene(SceneId::from("S1"));

    manager
        .create_versioned_assets(&scope, AssetKind::SceneVideo, vec![video("a")], true)
        .await
        .unwrap();
    manager
        .create_versioned_assets(&scope, AssetKind::SceneVideo, vec![video("b")], false)
        .await
        .unwrap();

    let best = manager.best_version(&scope, AssetKind::SceneVideo).await.unwrap().unwrap();
    check!(best.version == 1);
    check!(best.data == "a");
}

#[test]
async fn best_pointer_rollback_and_unset() {
    let project_id = ProjectId::from("P1");
    let repo = seeded_project_repo(&project_id).await;
    let manager = AssetManagerDefault::new(repo);
    let scope = AssetScope::Scene(SceneId::from("S1"));

    manager
        .create_versioned_assets(
            &scope,
            AssetKind::SceneVideo,
            vec![video("a"), video("b"), video("c")],
            true,
        )
        .await
        .unwrap();

    manager.set_best_version(&scope, AssetKind::SceneVideo, 2).await.unwrap();
    let best = manager.best_version(&scope, AssetKind::SceneVideo).await.unwrap().unwrap();
    check!(best.version == 2);

    // Idempotent.
    manager.set_best_version(&scope, AssetKind::SceneVideo, 2).await.unwrap();
    check!(
        manager.best_version(&scope, AssetKind::SceneVideo).await.unwrap().unwrap().version == 2
    );

    // Zero unsets.
    manager.set_best_version(&scope, AssetKind::SceneVideo, 0).await.unwrap();
    check!(manager.best_version(&scope, AssetKind::SceneVideo).await.unwrap().is_none());

    let out_of_range = manager.set_best_version(&scope, AssetKind::SceneVideo, 9).await;
    check!(matches!(out_of_range, Err(AssetError::InvalidBest(_))));
}

#[test]
async fn scopes_are_isolated() {
    let project_id = ProjectId::from("P1");
    let repo = seeded_project_repo(&project_id).await;
    let manager = AssetManagerDefault::new(repo);

    let scene_scope = AssetScope::Scene(SceneId::from("S1"));
    let project_scope = AssetScope::Project(project_id.clone());

    manager
        .create_versioned_assets(&scene_scope, AssetKind::SceneVideo, vec![video("a")], true)
        .await
        .unwrap();
    manager
        .create_versioned_assets(
            &project_scope,
            AssetKind::EnhancedPrompt,
            vec![NewAssetVersion {
                data: "a better prompt".to_string(),
                asset_type: AssetType::Text,
                metadata: AssetMetadata::default(),
            }],
            true,
        )
        .await
        .unwrap();

    check!(
        manager.next_version_number(&scene_scope, AssetKind::SceneVideo).await.unwrap() == 2
    );
    check!(
        manager
            .next_version_number(&project_scope, AssetKind::SceneVideo)
            .await
            .unwrap()
            == 1
    );
}

#[test]
async fn unknown_scope_is_an_error() {
    let project_id = ProjectId::from("P1");
    let repo = seeded_project_repo(&project_id).await;
    let manager = AssetManagerDefault::new(repo);
    let scope = AssetScope::Scene(SceneId::from("does-not-exist"));

    let result = manager.next_version_number(&scope, AssetKind::SceneVideo).await;
    check!(matches!(result, Err(AssetError::ScopeNotFound(_))));
}
