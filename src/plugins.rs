use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::{extract::Path as UrlPath, Json};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::app::{app_state, data_path};
use crate::ids::new_id;
use crate::store::{Identified, ListStore, StoreError};
use crate::ApiResponse;

/// Lifecycle points a plugin can subscribe to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PluginTrigger {
    OnManual,
    OnSubscribe,
    OnGenerate,
    OnStartup,
    OnShutdown,
    BeforeCoreStart,
    OnCoreStarted,
    BeforeCoreStop,
    OnCoreStopped,
}

impl PluginTrigger {
    pub const ALL: [PluginTrigger; 9] = [
        PluginTrigger::OnManual,
        PluginTrigger::OnSubscribe,
        PluginTrigger::OnGenerate,
        PluginTrigger::OnStartup,
        PluginTrigger::OnShutdown,
        PluginTrigger::BeforeCoreStart,
        PluginTrigger::OnCoreStarted,
        PluginTrigger::BeforeCoreStop,
        PluginTrigger::OnCoreStopped,
    ];

    /// Name of the function the plugin source must define for this trigger.
    pub fn entry(&self) -> &'static str {
        match self {
            PluginTrigger::OnManual => "onRun",
            PluginTrigger::OnSubscribe => "onSubscribe",
            PluginTrigger::OnGenerate => "onGenerate",
            PluginTrigger::OnStartup => "onStartup",
            PluginTrigger::OnShutdown => "onShutdown",
            PluginTrigger::BeforeCoreStart => "onBeforeCoreStart",
            PluginTrigger::OnCoreStarted => "onCoreStarted",
            PluginTrigger::BeforeCoreStop => "onBeforeCoreStop",
            PluginTrigger::OnCoreStopped => "onCoreStopped",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PluginSource {
    #[default]
    Http,
    File,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PluginOption {
    pub key: String,
    #[serde(default)]
    pub value: JsonValue,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Plugin {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub source: PluginSource,
    #[serde(default)]
    pub url: String,
    /// Relative to the data root.
    pub path: String,
    #[serde(default)]
    pub triggers: Vec<PluginTrigger>,
    #[serde(default)]
    pub configuration: Vec<PluginOption>,
    #[serde(default)]
    pub disabled: bool,
}

impl Identified for Plugin {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin {0} not found")]
    NotFound(String),
    #[error("plugin [{0}] is disabled")]
    Disabled(String),
    #[error("plugin [{0}] has no cached source code")]
    MissingSource(String),
    #[error("[{plugin}] Error: {message}")]
    Hook { plugin: String, message: String },
    #[error("[{plugin}] Error: Wrong result")]
    WrongResult { plugin: String },
    #[error("failed to update plugin [{plugin}]: {message}")]
    Update { plugin: String, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a script is allowed to touch on the host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub read_files: bool,
    pub write_files: bool,
    pub http: bool,
    /// File access, when granted, is confined below this directory.
    pub root: PathBuf,
}

impl Capabilities {
    /// Pure transforms: no I/O at all.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn plugin(root: &Path) -> Self {
        Self {
            read_files: true,
            write_files: true,
            http: true,
            root: root.to_path_buf(),
        }
    }
}

/// One invocation of a user-supplied script.
#[derive(Clone, Debug)]
pub struct ScriptCall {
    /// Plugin name or script owner, used in error messages.
    pub label: String,
    pub source: String,
    pub entry: String,
    pub args: Vec<JsonValue>,
    /// Exposed to plugin code as its `Plugin` settings object.
    pub settings: JsonValue,
    pub capabilities: Capabilities,
}

/// Executes user scripts. The sandbox behind it is pluggable.
pub trait ScriptRuntime: Send + Sync {
    fn invoke(&self, call: ScriptCall) -> BoxFuture<'_, Result<JsonValue, String>>;

    /// False when every `invoke` is refused.
    fn is_available(&self) -> bool {
        true
    }
}

/// Runtime used when no sandbox is configured: refuses to run anything.
/// Stock (no-op) scripts never reach a runtime, so only custom profile
/// scripts, subscription scripts and plugins are affected.
pub struct UnavailableRuntime;

impl ScriptRuntime for UnavailableRuntime {
    fn invoke(&self, call: ScriptCall) -> BoxFuture<'_, Result<JsonValue, String>> {
        Box::pin(async move {
            Err(format!(
                "cannot run {} of {}: no script runtime is configured",
                call.entry, call.label
            ))
        })
    }

    fn is_available(&self) -> bool {
        false
    }
}

/// True for scripts that only return their input unchanged.
pub fn is_noop_script(source: &str, stock: &str) -> bool {
    let normalize = |s: &str| s.split_whitespace().collect::<String>();
    let source = normalize(source);
    source.is_empty() || source == normalize(stock)
}

type TriggerIndex = HashMap<PluginTrigger, Vec<String>>;

pub struct PluginRegistry {
    store: ListStore<Plugin>,
    data_root: PathBuf,
    runtime: Arc<dyn ScriptRuntime>,
    /// Trigger -> plugin IDs, in plugin-list order. Rebuilt on every list change.
    index: RwLock<TriggerIndex>,
    code: RwLock<HashMap<String, String>>,
    /// `pluginSettings` from the app settings: plugin ID -> key -> value.
    user_settings: RwLock<BTreeMap<String, BTreeMap<String, JsonValue>>>,
}

impl PluginRegistry {
    pub fn load(
        data_root: &Path,
        debounce: Duration,
        runtime: Arc<dyn ScriptRuntime>,
    ) -> Result<Self, String> {
        let store = ListStore::load(data_root.join("config").join("plugins.yaml"), debounce)?;
        let registry = Self::with_store(store, data_root, runtime);
        registry.reload_code();
        Ok(registry)
    }

    pub fn with_store(store: ListStore<Plugin>, data_root: &Path, runtime: Arc<dyn ScriptRuntime>) -> Self {
        Self {
            store,
            data_root: data_root.to_path_buf(),
            runtime,
            index: RwLock::new(HashMap::new()),
            code: RwLock::new(HashMap::new()),
            user_settings: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn store(&self) -> &ListStore<Plugin> {
        &self.store
    }

    pub fn runtime(&self) -> &dyn ScriptRuntime {
        self.runtime.as_ref()
    }

    pub fn set_user_settings(&self, settings: BTreeMap<String, BTreeMap<String, JsonValue>>) {
        *self.user_settings.write().expect("plugin settings rwlock poisoned") = settings;
    }

    /// Reads every plugin's source from disk into the code cache and rebuilds
    /// the trigger index. Plugins whose source is missing are skipped.
    pub fn reload_code(&self) {
        let mut cache = HashMap::new();
        for plugin in self.store.snapshot() {
            let path = data_path(&self.data_root, &plugin.path);
            match std::fs::read_to_string(&path) {
                Ok(code) => {
                    cache.insert(plugin.id.clone(), code);
                }
                Err(err) => {
                    tracing::debug!("plugin {} has no source at {}: {err}", plugin.name, path.display());
                }
            }
        }
        *self.code.write().expect("plugin code rwlock poisoned") = cache;
        self.rebuild_index();
    }

    pub fn set_code(&self, id: &str, code: String) {
        self.code
            .write()
            .expect("plugin code rwlock poisoned")
            .insert(id.to_string(), code);
        self.rebuild_index();
    }

    fn rebuild_index(&self) {
        let code = self.code.read().expect("plugin code rwlock poisoned");
        let mut index = TriggerIndex::new();
        for plugin in self.store.snapshot() {
            if !code.contains_key(&plugin.id) {
                continue;
            }
            for trigger in &plugin.triggers {
                let observers = index.entry(*trigger).or_default();
                if !observers.contains(&plugin.id) {
                    observers.push(plugin.id.clone());
                }
            }
        }
        *self.index.write().expect("plugin index rwlock poisoned") = index;
    }

    pub fn observers(&self, trigger: PluginTrigger) -> Vec<String> {
        self.index
            .read()
            .expect("plugin index rwlock poisoned")
            .get(&trigger)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn add(&self, plugin: Plugin) -> Result<(), PluginError> {
        self.store.add(plugin).await?;
        self.rebuild_index();
        Ok(())
    }

    pub async fn edit(&self, id: &str, plugin: Plugin) -> Result<(), PluginError> {
        self.store.edit(id, plugin).await?;
        self.rebuild_index();
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<Plugin, PluginError> {
        let removed = self.store.delete(id).await?;
        self.code
            .write()
            .expect("plugin code rwlock poisoned")
            .remove(id);
        self.rebuild_index();
        Ok(removed)
    }

    /// Refreshes a plugin's source: File plugins are re-read from `path`,
    /// Http plugins are downloaded from `url` and written to `path`.
    pub async fn update_source(&self, id: &str, http: &reqwest::Client) -> Result<(), PluginError> {
        let plugin = self
            .store
            .get(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        if plugin.disabled {
            return Err(PluginError::Disabled(plugin.name));
        }

        let path = data_path(&self.data_root, &plugin.path);
        let update_err = |message: String| PluginError::Update {
            plugin: plugin.name.clone(),
            message,
        };

        let code = match plugin.source {
            PluginSource::File => std::fs::read_to_string(&path)
                .map_err(|err| update_err(format!("failed to read {}: {err}", path.display())))?,
            PluginSource::Http => {
                let code = fetch_text(http, &plugin.url).await.map_err(update_err)?;
                crate::store::write_atomic(&path, code.as_bytes()).map_err(update_err)?;
                code
            }
        };

        self.set_code(id, code);
        tracing::info!("plugin {} updated", plugin.name);
        Ok(())
    }

    fn settings_for(&self, plugin: &Plugin) -> JsonValue {
        let user = self.user_settings.read().expect("plugin settings rwlock poisoned");
        let values: serde_json::Map<String, JsonValue> = match user.get(&plugin.id) {
            Some(stored) => stored.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            None => plugin
                .configuration
                .iter()
                .map(|opt| (opt.key.clone(), opt.value.clone()))
                .collect(),
        };
        JsonValue::Object(values)
    }

    /// Enabled observers of `trigger` together with their cached source.
    fn runnable(&self, trigger: PluginTrigger) -> Vec<(Plugin, String)> {
        let code = self.code.read().expect("plugin code rwlock poisoned");
        self.observers(trigger)
            .into_iter()
            .filter_map(|id| {
                let plugin = self.store.get(&id)?;
                if plugin.disabled {
                    return None;
                }
                let source = code.get(&id)?.clone();
                Some((plugin, source))
            })
            .collect()
    }

    async fn call(
        &self,
        plugin: &Plugin,
        source: String,
        entry: &str,
        args: Vec<JsonValue>,
    ) -> Result<JsonValue, PluginError> {
        let call = ScriptCall {
            label: plugin.name.clone(),
            source,
            entry: entry.to_string(),
            args,
            settings: self.settings_for(plugin),
            capabilities: Capabilities::plugin(&self.data_root),
        };
        self.runtime
            .invoke(call)
            .await
            .map_err(|message| PluginError::Hook {
                plugin: plugin.name.clone(),
                message,
            })
    }

    /// Chains every on-subscribe hook over the proxy list. Each hook must
    /// hand back a list.
    pub async fn on_subscribe(
        &self,
        mut proxies: Vec<JsonValue>,
        subscription: &JsonValue,
    ) -> Result<Vec<JsonValue>, PluginError> {
        let trigger = PluginTrigger::OnSubscribe;
        for (plugin, source) in self.runnable(trigger) {
            let args = vec![JsonValue::Array(proxies), subscription.clone()];
            match self.call(&plugin, source, trigger.entry(), args).await? {
                JsonValue::Array(list) => proxies = list,
                _ => return Err(PluginError::WrongResult { plugin: plugin.name }),
            }
        }
        Ok(proxies)
    }

    /// on-generate: `(config, profile) -> config`.
    pub async fn on_generate(
        &self,
        config: serde_yaml::Value,
        profile: &JsonValue,
    ) -> Result<serde_yaml::Value, PluginError> {
        self.transform_config(PluginTrigger::OnGenerate, config, profile)
            .await
    }

    /// before-core-start: `(config, profile) -> config`, only when the
    /// document is written for a kernel start.
    pub async fn before_core_start(
        &self,
        config: serde_yaml::Value,
        profile: &JsonValue,
    ) -> Result<serde_yaml::Value, PluginError> {
        self.transform_config(PluginTrigger::BeforeCoreStart, config, profile)
            .await
    }

    async fn transform_config(
        &self,
        trigger: PluginTrigger,
        mut config: serde_yaml::Value,
        profile: &JsonValue,
    ) -> Result<serde_yaml::Value, PluginError> {
        for (plugin, source) in self.runnable(trigger) {
            let wrong = || PluginError::WrongResult {
                plugin: plugin.name.clone(),
            };
            let arg = serde_json::to_value(&config).map_err(|_| wrong())?;
            let result = self
                .call(&plugin, source, trigger.entry(), vec![arg, profile.clone()])
                .await?;
            if !result.is_object() {
                return Err(wrong());
            }
            config = serde_yaml::to_value(result).map_err(|_| wrong())?;
        }
        Ok(config)
    }

    /// Fires a trigger whose hooks take no arguments and return nothing.
    pub async fn fire(&self, trigger: PluginTrigger) -> Result<(), PluginError> {
        for (plugin, source) in self.runnable(trigger) {
            self.call(&plugin, source, trigger.entry(), Vec::new()).await?;
        }
        Ok(())
    }

    /// Runs a plugin on demand. `event` defaults to the on-manual entry point.
    pub async fn run_manual(&self, id: &str, event: Option<&str>) -> Result<JsonValue, PluginError> {
        let plugin = self
            .store
            .get(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        let source = self
            .code
            .read()
            .expect("plugin code rwlock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::MissingSource(plugin.name.clone()))?;
        if plugin.disabled {
            return Err(PluginError::Disabled(plugin.name));
        }
        let entry = event.unwrap_or(PluginTrigger::OnManual.entry());
        self.call(&plugin, source, entry, Vec::new()).await
    }
}

async fn fetch_text(http: &reqwest::Client, url: &str) -> Result<String, String> {
    let resp = http
        .get(url)
        .send()
        .await
        .map_err(|err| format!("failed to send request: {err}"))?;
    let resp = resp
        .error_for_status()
        .map_err(|err| format!("request failed: {err}"))?;
    resp.text()
        .await
        .map_err(|err| format!("failed to read response body: {err}"))
}

// ---------------------------------------------------------------------------
// HTTP handlers

#[derive(Deserialize)]
pub struct PluginRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub source: PluginSource,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub triggers: Vec<PluginTrigger>,
    #[serde(default)]
    pub configuration: Vec<PluginOption>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Deserialize, Default)]
pub struct RunPluginRequest {
    #[serde(default)]
    pub event: Option<String>,
}

fn plugin_error_code(err: &PluginError) -> &'static str {
    match err {
        PluginError::NotFound(_) | PluginError::Store(StoreError::NotFound(_)) => "plugin_not_found",
        PluginError::Disabled(_) => "plugin_disabled",
        PluginError::MissingSource(_) => "plugin_source_missing",
        PluginError::Hook { .. } | PluginError::WrongResult { .. } => "plugin_failed",
        PluginError::Update { .. } => "plugin_update_failed",
        PluginError::Store(_) => "plugin_save_failed",
    }
}

fn plugin_from_request(id: String, body: PluginRequest) -> Plugin {
    let path = body
        .path
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| format!("plugins/{id}.js"));
    Plugin {
        id,
        name: body.name,
        description: body.description,
        source: body.source,
        url: body.url,
        path,
        triggers: body.triggers,
        configuration: body.configuration,
        disabled: body.disabled,
    }
}

pub async fn list_plugins() -> Json<ApiResponse<Vec<Plugin>>> {
    Json(ApiResponse::ok(app_state().plugins.store().snapshot()))
}

pub async fn create_plugin(Json(body): Json<PluginRequest>) -> Json<ApiResponse<Plugin>> {
    let state = app_state();
    let plugin = plugin_from_request(new_id(), body);

    if let Err(err) = state.plugins.add(plugin.clone()).await {
        tracing::error!("failed to create plugin {}: {err}", plugin.name);
        return Json(ApiResponse::error(plugin_error_code(&err), err.to_string()));
    }

    // 新建插件后立即尝试拉取源码，失败只记录日志，插件本身仍然保留。
    if let Err(err) = state.plugins.update_source(&plugin.id, &state.http_client).await {
        tracing::warn!("{err}");
    }

    Json(ApiResponse::ok(plugin))
}

pub async fn update_plugin(
    UrlPath(id): UrlPath<String>,
    Json(body): Json<PluginRequest>,
) -> Json<ApiResponse<Plugin>> {
    let plugin = plugin_from_request(id.clone(), body);
    match app_state().plugins.edit(&id, plugin.clone()).await {
        Ok(()) => Json(ApiResponse::ok(plugin)),
        Err(err) => {
            tracing::error!("failed to update plugin {id}: {err}");
            Json(ApiResponse::error(plugin_error_code(&err), err.to_string()))
        }
    }
}

pub async fn delete_plugin(UrlPath(id): UrlPath<String>) -> Json<ApiResponse<JsonValue>> {
    let state = app_state();
    match state.plugins.delete(&id).await {
        Ok(plugin) => {
            let path = data_path(&state.data_root, &plugin.path);
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("failed to remove plugin source {}: {err}", path.display());
                }
            }
            Json(ApiResponse::ok(serde_json::json!({})))
        }
        Err(err) => Json(ApiResponse::error(plugin_error_code(&err), err.to_string())),
    }
}

pub async fn refresh_plugin(UrlPath(id): UrlPath<String>) -> Json<ApiResponse<JsonValue>> {
    let state = app_state();
    match state.plugins.update_source(&id, &state.http_client).await {
        Ok(()) => Json(ApiResponse::ok(serde_json::json!({}))),
        Err(err) => {
            tracing::error!("{err}");
            Json(ApiResponse::error(plugin_error_code(&err), err.to_string()))
        }
    }
}

pub async fn run_plugin(
    UrlPath(id): UrlPath<String>,
    body: Option<Json<RunPluginRequest>>,
) -> Json<ApiResponse<JsonValue>> {
    let event = body.and_then(|Json(b)| b.event);
    match app_state().plugins.run_manual(&id, event.as_deref()).await {
        Ok(result) => Json(ApiResponse::ok(result)),
        Err(err) => {
            tracing::warn!("{err}");
            Json(ApiResponse::error(plugin_error_code(&err), err.to_string()))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every call and answers from a closure.
    pub(crate) struct FakeRuntime<F> {
        pub calls: Mutex<Vec<ScriptCall>>,
        respond: F,
    }

    impl<F> FakeRuntime<F>
    where
        F: Fn(&ScriptCall) -> Result<JsonValue, String> + Send + Sync,
    {
        pub(crate) fn new(respond: F) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                respond,
            }
        }
    }

    impl<F> ScriptRuntime for FakeRuntime<F>
    where
        F: Fn(&ScriptCall) -> Result<JsonValue, String> + Send + Sync,
    {
        fn invoke(&self, call: ScriptCall) -> BoxFuture<'_, Result<JsonValue, String>> {
            let result = (self.respond)(&call);
            self.calls.lock().unwrap().push(call);
            Box::pin(async move { result })
        }
    }

    pub(crate) fn plugin(name: &str, triggers: &[PluginTrigger]) -> Plugin {
        let id = new_id();
        Plugin {
            path: format!("plugins/{id}.js"),
            id,
            name: name.to_string(),
            description: String::new(),
            source: PluginSource::File,
            url: String::new(),
            triggers: triggers.to_vec(),
            configuration: vec![PluginOption {
                key: "mode".to_string(),
                value: serde_json::json!("default"),
            }],
            disabled: false,
        }
    }

    pub(crate) async fn registry_with(
        root: &Path,
        plugins: Vec<Plugin>,
        runtime: Arc<dyn ScriptRuntime>,
    ) -> PluginRegistry {
        let store = ListStore::new(root.join("config").join("plugins.yaml"), Duration::ZERO);
        let registry = PluginRegistry::with_store(store, root, runtime);
        for p in plugins {
            let id = p.id.clone();
            registry.add(p).await.unwrap();
            registry.set_code(&id, "// plugin".to_string());
        }
        registry
    }

    #[tokio::test]
    async fn hooks_run_in_plugin_list_order() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(|call| {
            let mut list = call.args[0].as_array().cloned().unwrap_or_default();
            list.push(serde_json::json!({ "name": call.label }));
            Ok(JsonValue::Array(list))
        }));
        let first = plugin("first", &[PluginTrigger::OnSubscribe]);
        let second = plugin("second", &[PluginTrigger::OnSubscribe, PluginTrigger::OnStartup]);
        let registry = registry_with(dir.path(), vec![first, second], runtime.clone()).await;

        let out = registry
            .on_subscribe(Vec::new(), &serde_json::json!({}))
            .await
            .unwrap();
        let names: Vec<_> = out.iter().map(|p| p["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(runtime.calls.lock().unwrap()[0].entry, "onSubscribe");
    }

    #[tokio::test]
    async fn non_list_result_names_the_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(|_| Ok(serde_json::json!({ "oops": true }))));
        let registry = registry_with(
            dir.path(),
            vec![plugin("converter", &[PluginTrigger::OnSubscribe])],
            runtime,
        )
        .await;

        let err = registry
            .on_subscribe(Vec::new(), &serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "[converter] Error: Wrong result");
    }

    #[tokio::test]
    async fn disabled_plugins_and_edits_update_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(|_| Ok(JsonValue::Null)));
        let mut p = plugin("watcher", &[PluginTrigger::OnStartup]);
        let registry = registry_with(dir.path(), vec![p.clone()], runtime.clone()).await;
        assert_eq!(registry.observers(PluginTrigger::OnStartup), vec![p.id.clone()]);

        p.triggers = vec![PluginTrigger::OnShutdown];
        registry.edit(&p.id.clone(), p.clone()).await.unwrap();
        assert!(registry.observers(PluginTrigger::OnStartup).is_empty());
        assert_eq!(registry.observers(PluginTrigger::OnShutdown), vec![p.id.clone()]);

        p.disabled = true;
        registry.edit(&p.id.clone(), p).await.unwrap();
        registry.fire(PluginTrigger::OnShutdown).await.unwrap();
        assert!(runtime.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn user_settings_override_declared_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(|call| Ok(call.settings.clone())));
        let p = plugin("tuner", &[PluginTrigger::OnManual]);
        let registry = registry_with(dir.path(), vec![p.clone()], runtime).await;

        let result = registry.run_manual(&p.id, None).await.unwrap();
        assert_eq!(result["mode"], "default");

        let mut stored = BTreeMap::new();
        stored.insert("mode".to_string(), serde_json::json!("custom"));
        registry.set_user_settings(BTreeMap::from([(p.id.clone(), stored)]));
        let result = registry.run_manual(&p.id, None).await.unwrap();
        assert_eq!(result["mode"], "custom");
    }

    #[tokio::test]
    async fn on_generate_requires_a_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(|_| Ok(serde_json::json!([1, 2]))));
        let registry = registry_with(
            dir.path(),
            vec![plugin("broken", &[PluginTrigger::OnGenerate])],
            runtime,
        )
        .await;

        let config: serde_yaml::Value = serde_yaml::from_str("mode: rule").unwrap();
        let err = registry
            .on_generate(config, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::WrongResult { plugin } if plugin == "broken"));
    }

    #[test]
    fn stock_script_counts_as_noop() {
        let stock = crate::profiles::DEFAULT_GENERATE_SCRIPT;
        assert!(is_noop_script("", stock));
        assert!(is_noop_script(&stock.replace('\n', "\n\n  "), stock));
        assert!(!is_noop_script("const onGenerate = (c) => ({ ...c, mode: 'global' })", stock));
    }
}
