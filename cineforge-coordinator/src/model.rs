use cineforge_common::model::{AssetKind, CommandId, ProjectId, SceneId};
use serde::Deserialize;
use serde_json::Value;

/// Operator commands, closed set. Each is idempotent on its `commandId`.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    StartPipeline {
        initial_prompt: String,
        audio_gcs_uri: Option<String>,
        metadata: Value,
    },
    ResumePipeline,
    RegenerateScene {
        scene_id: SceneId,
        prompt_modification: Option<String>,
    },
    RegenerateFrame {
        scene_id: SceneId,
        frame: FramePosition,
        prompt_modification: Option<String>,
    },
    UpdateSceneAsset {
        scene_id: SceneId,
        asset_key: AssetKind,
        version: u32,
    },
    ResolveIntervention {
        action: ResolveAction,
    },
    StopPipeline,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum FramePosition {
    Start,
    End,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResolveAction {
    Abort,
    Skip,
    RetryWithRevisedParams { revised_params: Value },
}

/// A command as it arrives on the commands topic:
/// `{type, projectId, commandId, payload}`.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandEnvelope {
    pub command_id: CommandId,
    pub project_id: ProjectId,
    pub command: Command,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid command: {0}")]
pub struct CommandParseError(pub String);

#[derive(Deserialize)]
struct RawCommand {
    #[serde(rename = "type")]
    command_type: String,
    #[serde(rename = "projectId")]
    project_id: String,
    #[serde(rename = "commandId")]
    command_id: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPayload {
    initial_prompt: String,
    #[serde(default)]
    audio_gcs_uri: Option<String>,
    #[serde(default)]
    metadata: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegenerateScenePayload {
    scene_id: String,
    #[serde(default)]
    prompt_modification: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegenerateFramePayload {
    scene_id: String,
    frame: String,
    #[serde(default)]
    prompt_modification: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSceneAssetPayload {
    scene_id: String,
    asset_key: AssetKind,
    version: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolvePayload {
    action: String,
    #[serde(default)]
    revised_params: Option<Value>,
}

impl TryFrom<Value> for CommandEnvelope {
    type Error = CommandParseError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let raw: RawCommand = serde_json::from_value(value)
            .map_err(|e| CommandParseError(format!("bad command envelope: {e}")))?;

        let command = match raw.command_type.as_str() {
            "START_PIPELINE" => {
                let payload: StartPayload = parse_payload(raw.payload)?;
                Command::StartPipeline {
                    initial_prompt: payload.initial_prompt,
                    audio_gcs_uri: payload.audio_gcs_uri,
                    metadata: payload.metadata,
                }
            }
            "RESUME_PIPELINE" => Command::ResumePipeline,
            "REGENERATE_SCENE" => {
                let payload: RegenerateScenePayload = parse_payload(raw.payload)?;
                Command::RegenerateScene {
                    scene_id: SceneId(payload.scene_id),
                    prompt_modification: payload.prompt_modification,
                }
            }
            "REGENERATE_FRAME" => {
                let payload: RegenerateFramePayload = parse_payload(raw.payload)?;
                let frame = payload
                    .frame
                    .parse::<FramePosition>()
                    .map_err(|_| CommandParseError(format!("bad frame: {}", payload.frame)))?;
                Command::RegenerateFrame {
                    scene_id: SceneId(payload.scene_id),
                    frame,
                    prompt_modification: payload.prompt_modification,
                }
            }
            "UPDATE_SCENE_ASSET" => {
                let payload: UpdateSceneAssetPayload = parse_payload(raw.payload)?;
                Command::UpdateSceneAsset {
                    scene_id: SceneId(payload.scene_id),
                    asset_key: payload.asset_key,
                    version: payload.version,
                }
            }
            "RESOLVE_INTERVENTION" => {
                let payload: ResolvePayload = parse_payload(raw.payload)?;
                let action = match payload.action.as_str() {
                    "abort" => ResolveAction::Abort,
                    "skip" => ResolveAction::Skip,
                    "retry_with_revised_params" => ResolveAction::RetryWithRevisedParams {
                        revised_params: payload.revised_params.unwrap_or(Value::Null),
                    },
                    other => {
                        return Err(CommandParseError(format!("bad resolve action: {other}")))
                    }
                };
                Command::ResolveIntervention { action }
            }
            "STOP_PIPELINE" => Command::StopPipeline,
            other => return Err(CommandParseError(format!("unknown command type: {other}"))),
        };

        Ok(CommandEnvelope {
            command_id: CommandId(raw.command_id),
            project_id: ProjectId(raw.project_id),
            command,
        })
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, CommandParseError> {
    serde_json::from_value(payload).map_err(|e| CommandParseError(format!("bad payload: {e}")))
}
