//! Collaborator interfaces for the heavy lifting workers delegate out:
//! generative model inference and media-blob storage. The control plane
//! only depends on these traits; the deterministic in-repo implementations
//! back single-node deployments and tests.

use async_trait::async_trait;
use cineforge_common::SafeDisplay;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Network trouble, 5xx, rate limiting: worth a retry later.
    #[error("transient model error: {0}")]
    Transient(String),
    /// The provider's safety layer rejected the prompt.
    #[error("safety rejection: {0}")]
    Safety(String),
    /// The request itself is malformed; retrying cannot help.
    #[error("invalid model request: {0}")]
    Invalid(String),
}

impl SafeDisplay for ModelError {
    fn to_safe_string(&self) -> String {
        match self {
            Self::Transient(_) => "transient model error".to_string(),
            Self::Safety(_) => self.to_string(),
            Self::Invalid(_) => self.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedText {
    pub text: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct GeneratedMedia {
    pub uri: String,
    pub model: String,
}

/// One client for every modality the pipeline needs. Kept as a single
/// trait so handler wiring stays a one-liner; a real deployment backs it
/// with provider SDKs.
#[async_trait]
pub trait GenerativeModelClient: Send + Sync {
    async fn generate_text(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<GeneratedText, ModelError>;

    /// Structured output, e.g. a storyboard or analysis document.
    async fn generate_json(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, ModelError>;

    async fn generate_image(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<GeneratedMedia, ModelError>;

    async fn generate_video(
        &self,
        prompt: &str,
        start_frame: Option<&str>,
        end_frame: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<GeneratedMedia, ModelError>;
}

/// Blob storage for rendered media; assets reference blobs by URI.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn store(&self, key: &str, content_type: &str) -> Result<String, ModelError>;

    async fn concatenate(&self, inputs: &[String], key: &str) -> Result<String, ModelError>;
}

/// Deterministic stand-in used by single-node runs and the test suite.
/// Prompts containing `"unsafe"` are rejected the way a provider safety
/// layer would, which is what the worker's sanitize-and-retry path is
/// exercised against.
pub struct StubGenerativeModelClient {
    model_name: String,
}

impl StubGenerativeModelClient {
    pub fn new() -> Self {
        Self {
            model_name: "stub-model-001".to_string(),
        }
    }
}

impl Default for StubGenerativeModelClient {
    fn default() -> Self {
        Self::new()
    }
}

fn check_prompt(prompt: &str) -> Result<(), ModelError> {
    if prompt.trim().is_empty() {
        return Err(ModelError::Invalid("empty prompt".to_string()));
    }
    if prompt.contains("unsafe") {
        return Err(ModelError::Safety(format!(
            "prompt rejected by safety filter: {}",
            &prompt[..prompt.len().min(64)]
        )));
    }
    Ok(())
}

#[async_trait]
impl GenerativeModelClient for StubGenerativeModelClient {
    async fn generate_text(
        &self,
        prompt: &str,
        _cancel: &CancellationToken,
    ) -> Result<GeneratedText, ModelError> {
        check_prompt(prompt)?;
        Ok(GeneratedText {
            text: format!("{prompt} (expanded with cinematic detail)"),
            model: self.model_name.clone(),
        })
    }

    async fn generate_json(
        &self,
        prompt: &str,
        _cancel: &CancellationToken,
    ) -> Result<Value, ModelError> {
        check_prompt(prompt)?;
        Ok(json!({ "prompt": prompt, "model": self.model_name }))
    }

    async fn generate_image(
        &self,
        prompt: &str,
        _cancel: &CancellationToken,
    ) -> Result<GeneratedMedia, ModelError> {
        check_prompt(prompt)?;
        Ok(GeneratedMedia {
            uri: format!("stub://images/{:x}.png", fingerprint(prompt)),
            model: self.model_name.clone(),
        })
    }

    async fn generate_video(
        &self,
        prompt: &str,
        start_frame: Option<&str>,
        end_frame: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<GeneratedMedia, ModelError> {
        check_prompt(prompt)?;
        let seed = format!("{prompt}|{start_frame:?}|{end_frame:?}");
        Ok(GeneratedMedia {
            uri: format!("stub://videos/{:x}.mp4", fingerprint(&seed)),
            model: self.model_name.clone(),
        })
    }
}

pub struct StubMediaStore {
    bucket: String,
}

impl StubMediaStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
        }
    }
}

#[async_trait]
impl MediaStore for StubMediaStore {
    async fn store(&self, key: &str, _content_type: &str) -> Result<String, ModelError> {
        Ok(format!("stub://{}/{key}", self.bucket))
    }

    async fn concatenate(&self, inputs: &[String], key: &str) -> Result<String, ModelError> {
        if inputs.is_empty() {
            return Err(ModelError::Invalid("nothing to concatenate".to_string()));
        }
        Ok(format!("stub://{}/{key}", self.bucket))
    }
}

/// Strips terms the safety layer flagged so the retry has a chance. The
/// real implementation rewrites via the model itself; the deterministic
/// version just drops the offending word.
pub fn sanitize_prompt(prompt: &str) -> String {
    prompt
        .split_whitespace()
        .filter(|word| !word.contains("unsafe"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn fingerprint(input: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    async fn stub_client_is_deterministic() {
        let client = StubGenerativeModelClient::new();
        let cancel = CancellationToken::new();
        let first = client.generate_image("a red cube", &cancel).await.unwrap();
        let second = client.generate_image("a red cube", &cancel).await.unwrap();
        assert_eq!(first.uri, second.uri);
    }

    #[test]
    async fn unsafe_prompts_are_rejected_then_sanitizable() {
        let client = StubGenerativeModelClient::new();
        let cancel = CancellationToken::new();
        let rejected = client.generate_text("an unsafe scene", &cancel).await;
        assert!(matches!(rejected, Err(ModelError::Safety(_))));

        let sanitized = sanitize_prompt("an unsafe scene");
        assert_eq!(sanitized, "an scene");
        assert!(client.generate_text(&sanitized, &cancel).await.is_ok());
    }
}
