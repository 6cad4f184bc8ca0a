//! Caller-facing engine.
//!
//! ```rust,ignore
//! let engine = Engine::builder()
//!     .backend(my_backend)
//!     .builtin_profiles()
//!     .build()?;
//!
//! let mut handle = engine.start_run(case, "retention", RunOverrides::default())?;
//! let outcome = handle.wait().await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use quill_core::{
    BackendTable, CaseRecord, CompiledProfile, ConfigurationError, DomainProfile, SelectionPolicy,
};

use crate::backends::{BackendRegistry, GenerativeBackend};
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::descriptors::DescriptorRegistry;
use crate::orchestrator::{Delta, EventSink, FallbackController, RunError, RunEvent, RunOutcome, RunOverrides};
use crate::recorder::RunRecorder;
use crate::resilience::CircuitBreaker;
use crate::store::{KvStore, MemoryKvStore};

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    backends: BackendRegistry,
    profiles: Vec<DomainProfile>,
    builtin_profiles: bool,
    table: Option<BackendTable>,
    policy: Option<SelectionPolicy>,
    store: Option<Arc<dyn KvStore>>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn backend(mut self, backend: impl GenerativeBackend + 'static) -> Self {
        self.backends.register(Arc::new(backend));
        self
    }

    pub fn backend_arc(mut self, backend: Arc<dyn GenerativeBackend>) -> Self {
        self.backends.register(backend);
        self
    }

    /// Register a profile. Replaces a built-in profile with the same task type.
    pub fn profile(mut self, profile: DomainProfile) -> Self {
        self.profiles.push(profile);
        self
    }

    /// Include every profile shipped with `quill-core`.
    pub fn builtin_profiles(mut self) -> Self {
        self.builtin_profiles = true;
        self
    }

    /// Descriptor table. Defaults to the built-in table.
    pub fn table(mut self, table: BackendTable) -> Self {
        self.table = Some(table);
        self
    }

    /// Selection policy. Defaults to the built-in policy.
    pub fn policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Store for the run recorder. Defaults to an in-memory store.
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Engine, ConfigurationError> {
        self.config.validate()?;

        let table = match self.table {
            Some(table) => table,
            None => BackendTable::builtin()?,
        };
        let policy = match self.policy {
            Some(policy) => policy,
            None => SelectionPolicy::builtin()?,
        };
        policy.validate(&table)?;
        check_backends(&table, &self.backends)?;

        let mut definitions: BTreeMap<String, DomainProfile> = BTreeMap::new();
        if self.builtin_profiles {
            for profile in DomainProfile::builtins()? {
                definitions.insert(profile.task_type.clone(), profile);
            }
        }
        for profile in self.profiles {
            definitions.insert(profile.task_type.clone(), profile);
        }
        if definitions.is_empty() {
            return Err(ConfigurationError::Invalid(
                "no domain profiles registered".to_string(),
            ));
        }

        let mut profiles = BTreeMap::new();
        for (task, profile) in definitions {
            if let Some(tag) = &profile.required_capability {
                if table.with_capability(tag).next().is_none() {
                    return Err(ConfigurationError::Invalid(format!(
                        "profile '{}' requires capability '{}' that no backend has",
                        task, tag
                    )));
                }
            }
            profiles.insert(task, Arc::new(CompiledProfile::new(profile)?));
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryKvStore::new()) as Arc<dyn KvStore>);
        let recorder = RunRecorder::new(store, self.config.recorder.clone());

        tracing::info!(
            backends = self.backends.len(),
            profiles = profiles.len(),
            table_version = table.version,
            "Engine built"
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                backends: Arc::new(self.backends),
                profiles,
                descriptors: DescriptorRegistry::new(table),
                policy: Arc::new(policy),
                breaker: Arc::new(CircuitBreaker::new(self.config.circuit_breaker.clone())),
                recorder: Arc::new(recorder),
                config: Arc::new(self.config),
            }),
        })
    }
}

fn check_backends(table: &BackendTable, backends: &BackendRegistry) -> Result<(), ConfigurationError> {
    match table.ids().find(|id| !backends.contains(id)) {
        Some(missing) => Err(ConfigurationError::UnknownBackend(missing.to_string())),
        None => Ok(()),
    }
}

struct EngineInner {
    backends: Arc<BackendRegistry>,
    profiles: BTreeMap<String, Arc<CompiledProfile>>,
    descriptors: DescriptorRegistry,
    policy: Arc<SelectionPolicy>,
    breaker: Arc<CircuitBreaker>,
    recorder: Arc<RunRecorder>,
    config: Arc<EngineConfig>,
}

/// Runs cases through the pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Start a run in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_run(
        &self,
        case: CaseRecord,
        task_type: &str,
        overrides: RunOverrides,
    ) -> Result<RunHandle, ConfigurationError> {
        let profile = self
            .inner
            .profiles
            .get(task_type)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownTask(task_type.to_string()))?;

        let table = self.inner.descriptors.snapshot();
        if let Some(id) = &overrides.backend {
            if !table.contains(id) {
                return Err(ConfigurationError::UnknownBackend(id.clone()));
            }
        }

        let controller = FallbackController {
            profile,
            table,
            policy: self.inner.policy.clone(),
            backends: self.inner.backends.clone(),
            breaker: self.inner.breaker.clone(),
            recorder: self.inner.recorder.clone(),
            config: self.inner.config.clone(),
        };

        let run_id = Uuid::new_v4();
        let cancel = CancelToken::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        let run_cancel = cancel.clone();
        tokio::spawn(async move {
            let result = controller
                .run(run_id, case, overrides, EventSink::new(event_tx), run_cancel)
                .await;
            let _ = done_tx.send(result);
        });

        Ok(RunHandle {
            run_id,
            cancel,
            events: Some(event_rx),
            done: done_rx,
        })
    }

    /// Start a run and wait for it.
    pub async fn run(
        &self,
        case: CaseRecord,
        task_type: &str,
        overrides: RunOverrides,
    ) -> Result<RunOutcome, RunError> {
        self.start_run(case, task_type, overrides)?.wait().await
    }

    /// Install a new descriptor table for runs started from now on.
    pub fn publish_table(&self, table: BackendTable) -> Result<u64, ConfigurationError> {
        self.inner.policy.validate(&table)?;
        check_backends(&table, &self.inner.backends)?;
        self.inner.descriptors.publish(table)
    }

    pub fn table(&self) -> Arc<BackendTable> {
        self.inner.descriptors.snapshot()
    }

    pub fn recorder(&self) -> &RunRecorder {
        &self.inner.recorder
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.inner.profiles.keys().map(String::as_str)
    }
}

/// Handle to a run in progress.
pub struct RunHandle {
    run_id: Uuid,
    cancel: CancelToken,
    events: Option<mpsc::UnboundedReceiver<RunEvent>>,
    done: oneshot::Receiver<Result<RunOutcome, RunError>>,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.run_id
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that cancels this run, usable after the handle is consumed.
    pub fn canceller(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Take the event stream. Returns `None` after the first call.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<RunEvent>> {
        self.events.take()
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<RunOutcome, RunError> {
        self.done
            .await
            .map_err(|_| RunError::Internal("run task ended without a result".to_string()))?
    }

    /// Deliver deltas to `on_delta` in emission order, then the result to
    /// `on_done`.
    pub fn subscribe<D, F>(mut self, mut on_delta: D, on_done: F) -> JoinHandle<()>
    where
        D: FnMut(&Delta) + Send + 'static,
        F: FnOnce(Result<RunOutcome, RunError>) + Send + 'static,
    {
        let events = self.events.take();
        tokio::spawn(async move {
            if let Some(mut events) = events {
                while let Some(event) = events.recv().await {
                    if let RunEvent::Delta(delta) = &event {
                        on_delta(delta);
                    }
                }
            }
            on_done(self.wait().await);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ScriptedBackend;

    fn all_backends() -> EngineBuilder {
        let table = BackendTable::builtin().unwrap();
        let mut builder = Engine::builder();
        for id in table.ids() {
            builder = builder.backend(ScriptedBackend::replying(id, "ok"));
        }
        builder
    }

    #[test]
    fn test_build_requires_backend_for_every_descriptor() {
        let result = Engine::builder()
            .backend(ScriptedBackend::replying("gemini-pro", "ok"))
            .builtin_profiles()
            .build();
        assert!(matches!(result, Err(ConfigurationError::UnknownBackend(_))));
    }

    #[test]
    fn test_build_requires_profiles() {
        let result = all_backends().build();
        assert!(matches!(result, Err(ConfigurationError::Invalid(_))));
    }

    #[test]
    fn test_build_rejects_policy_with_unknown_backend() {
        let result = all_backends()
            .builtin_profiles()
            .policy(SelectionPolicy::new("nonexistent"))
            .build();
        assert!(matches!(result, Err(ConfigurationError::UnknownBackend(id)) if id == "nonexistent"));
    }

    #[test]
    fn test_build_rejects_unsatisfiable_capability() {
        let table = BackendTable::from_yaml(
            r#"
backends:
  - id: gemini-flash
    capability_tags: [short-form]
    default_temperature: 0.7
    max_output_tokens: 1500
    cost_class: economy
"#,
        )
        .unwrap();

        let result = Engine::builder()
            .backend(ScriptedBackend::replying("gemini-flash", "ok"))
            .table(table)
            .policy(SelectionPolicy::new("gemini-flash"))
            .profile(DomainProfile::builtin("retention").unwrap())
            .build();
        assert!(matches!(result, Err(ConfigurationError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_unknown_task_is_configuration_error() {
        let engine = all_backends().builtin_profiles().build().unwrap();
        let result = engine.start_run(CaseRecord::new("C-1"), "poetry", RunOverrides::default());
        assert!(matches!(result, Err(ConfigurationError::UnknownTask(_))));
    }

    #[tokio::test]
    async fn test_unknown_override_is_configuration_error() {
        let engine = all_backends().builtin_profiles().build().unwrap();
        let overrides = RunOverrides {
            backend: Some("mystery".to_string()),
            ..Default::default()
        };
        let result = engine.start_run(CaseRecord::new("C-1"), "retention", overrides);
        assert!(matches!(result, Err(ConfigurationError::UnknownBackend(_))));
    }

    #[test]
    fn test_task_types_listed() {
        let engine = all_backends().builtin_profiles().build().unwrap();
        let tasks: Vec<_> = engine.task_types().collect();
        assert_eq!(
            tasks,
            vec!["deescalation", "healthcare_appeal", "mortgage_denial", "retention"]
        );
    }

    #[test]
    fn test_publish_table_bumps_version() {
        let engine = all_backends().builtin_profiles().build().unwrap();
        let before = engine.table().version;
        let version = engine.publish_table(BackendTable::builtin().unwrap()).unwrap();
        assert_eq!(version, before + 1);
        assert_eq!(engine.table().version, version);
    }
}
