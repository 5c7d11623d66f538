test_r::enable!();


use async_trait::async_trait;
use cineforge_common::model::{
    COMMANDS_TOPIC, PIPELINE_EVENTS_TOPIC,
};
use cineforge_server::config::ServerConfig;
use cineforge_server::SingleNodeCluster;
use cineforge_service_base::events::{
    AttributeFilter, EventBus, EventEnvelope, Subscription,
};
use cineforge_worker::clients::{
    GeneratedMedia, GeneratedText, GenerativeModelClient, ModelError, StubGenerativeModelClient,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct Cluster {
    pub inner: SingleNodeCluster,
    pub cancel: CancellationToken,
    pub join_set: JoinSet<Result<(), anyhow::Error>>,
}

impl Cluster {
    pub async fn start(model_client: Option<Arc<dyn GenerativeModelClient>>) -> Self {
        Self::start_with_config(ServerConfig::default(), model_client).await
    }

    pub async fn start_with_config(
        config: ServerConfig,
        model_client: Option<Arc<dyn GenerativeModelClient>>,
    ) -> Self {
        let inner = SingleNodeCluster::in_memory(config, model_client);
        let cancel = CancellationToken::new();
        let mut join_set = JoinSet::new();
        inner.run(&mut join_set, cancel.clone()).await.unwrap();
        Self {
            inner,
            cancel,
            join_set,
        }
    }

    pub async fn pipeline_events(&self, types: &[&str]) -> Subscription {
        self.inner
            .event_bus
            .subscribe(PIPELINE_EVENTS_TOPIC, AttributeFilter::event_type_in(types))
            .await
            .unwrap()
    }

    pub async fn send_command(&self, command_type: &str, project_id: &str, payload: Value) {
        let command_id = uuid::Uuid::new_v4().to_string();
        let envelope = EventEnvelope::new(
            command_type,
            json!({
                "type": command_type,
                "projectId": project_id,
                "commandId": command_id,
                "payload": payload,
            }),
        );
        self.inner
            .event_bus
            .publish(COMMANDS_TOPIC, envelope)
            .await
            .unwrap();
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        while self.join_set.join_next().await.is_some() {}
    }
}

/// Waits for the next matching event or panics after the timeout.
pub async fn await_event(subscription: &mut Subscription, what: &str) -> EventEnvelope {
    match tokio::time::timeout(Duration::from_secs(20), subscription.next()).await {
        Ok(Some(delivery)) => delivery.envelope,
        Ok(None) => panic!("bus closed while waiting for {what}"),
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Polls until `probe` returns `Some`, or panics after ~10 seconds.
pub async fn eventually<T, F, Fut>(what: &str, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..200 {
        if let Some(value) = probe().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Wraps the stub client and parks video generation for the triggering
/// prompt until `release` is called, keeping the job visibly RUNNING.
pub struct GatedVideoClient {
    inner: StubGenerativeModelClient,
    trigger: String,
    gate: Arc<tokio::sync::Semaphore>,
}

impl GatedVideoClient {
    pub fn new(trigger: &str) -> (Arc<Self>, Arc<tokio::sync::Semaphore>) {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let client = Arc::new(Self {
            inner: StubGenerativeModelClient::new(),
            trigger: trigger.to_string(),
            gate: gate.clone(),
        });
        (client, gate)
    }
}

#[async_trait]
impl GenerativeModelClient for GatedVideoClient {
    async fn generate_text(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<GeneratedText, ModelError> {
        self.inner.generate_text(prompt, cancel).await
    }

    async fn generate_json(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, ModelError> {
        self.inner.generate_json(prompt, cancel).await
    }

    async fn generate_image(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<GeneratedMedia, ModelError> {
        self.inner.generate_image(prompt, cancel).await
    }

    async fn generate_video(
        &self,
        prompt: &str,
        start_frame: Option<&str>,
        end_frame: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<GeneratedMedia, ModelError> {
        if prompt.contains(&self.trigger) {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| ModelError::Transient("gate closed".to_string()))?;
            permit.forget();
        }
        self.inner
            .generate_video(prompt, start_frame, end_frame, cancel)
            .await
    }
}

/// Wraps the stub client and fails video generation with a transient error
/// whenever the prompt contains the trigger, up to `failures` times.
pub struct FlakyVideoClient {
    inner: StubGenerativeModelClient,
    trigger: String,
    failures_left: AtomicU32,
}

impl FlakyVideoClient {
    pub fn new(trigger: &str, failures: u32) -> Self {
        Self {
            inner: StubGenerativeModelClient::new(),
            trigger: trigger.to_string(),
            failures_left: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl GenerativeModelClient for FlakyVideoClient {
    async fn generate_text(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<GeneratedText, ModelError> {
        self.inner.generate_text(prompt, cancel).await
    }

    async fn generate_json(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, ModelError> {
        self.inner.generate_json(prompt, cancel).await
    }

    async fn generate_image(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<GeneratedMedia, ModelError> {
        self.inner.generate_image(prompt, cancel).await
    }

    async fn generate_video(
        &self,
        prompt: &str,
        start_frame: Option<&str>,
        end_frame: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<GeneratedMedia, ModelError> {
        if prompt.contains(&self.trigger) {
            let induced = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if induced {
                return Err(ModelError::Transient(
                    "video backend unavailable (induced)".to_string(),
                ));
            }
        }
        self.inner
            .generate_video(prompt, start_frame, end_frame, cancel)
            .await
    }
}
