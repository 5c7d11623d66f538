use serde::{Deserialize, Serialize};

/// Closed set of workflow stages. Adding or removing a stage is a design
/// change; nothing routes to a stage outside this enum.
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
pub enum Stage {
    ExpandCreativePrompt,
    CreateScenesFromAudio,
    GenerateStoryboardExclusivelyFromPrompt,
    EnrichStoryboardAndScenes,
    SemanticAnalysis,
    GenerateCharacterAssets,
    GenerateLocationAssets,
    GenerateSceneAssets,
    ProcessScene,
    RenderVideo,
    Finalize,
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn stage_names_are_snake_case() {
        assert_eq!(Stage::ExpandCreativePrompt.to_string(), "expand_creative_prompt");
        assert_eq!(
            Stage::GenerateStoryboardExclusivelyFromPrompt.to_string(),
            "generate_storyboard_exclusively_from_prompt"
        );
        assert_eq!("process_scene".parse::<Stage>().unwrap(), Stage::ProcessScene);
    }
}
