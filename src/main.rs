use axum::{
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::app::{app_state, AppState};
use crate::kernel::{KernelCoordinator, KernelDeps, KernelStatus, LifecycleHooks};
use crate::kernel_api::{HttpControlApi, NoopSystemProxy};
use crate::plugins::{PluginRegistry, PluginTrigger, UnavailableRuntime};
use crate::scheduler::ScheduledTask;
use crate::store::ListStore;
use crate::supervisor::TokioSupervisor;

mod app;
mod generator;
mod ids;
mod kernel;
mod kernel_api;
mod logs;
mod merge;
mod overrides;
mod plugins;
mod profiles;
mod rulesets;
mod scheduler;
mod store;
mod subscriptions;
mod supervisor;
mod ws;

/// Saves landing inside this window share one write.
const STORE_SAVE_DEBOUNCE: Duration = Duration::from_millis(200);
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
pub struct ApiResponse<T>
where
    T: Serialize,
{
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: "ok".to_string(),
            message: "success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }
}

/// `<root>/config/app.json`.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    #[serde(default)]
    pub active_profile_id: Option<String>,
    #[serde(default)]
    pub auto_start_kernel: bool,
    #[serde(default)]
    pub auto_restart_kernel: bool,
    #[serde(default)]
    pub auto_set_system_proxy: bool,
    #[serde(default)]
    pub kernel_binary: Option<String>,
    /// Plugin ID -> configuration key -> value.
    #[serde(default)]
    pub plugin_settings: BTreeMap<String, BTreeMap<String, JsonValue>>,
    #[serde(default)]
    pub subscription_auto_update: Option<ScheduledTask>,
    #[serde(default)]
    pub ruleset_auto_update: Option<ScheduledTask>,
}

impl AppSettings {
    fn apply_defaults(&mut self) {
        // 默认每天凌晨 3 点自动更新订阅与规则集
        self.subscription_auto_update
            .get_or_insert_with(ScheduledTask::nightly);
        self.ruleset_auto_update
            .get_or_insert_with(ScheduledTask::nightly);
    }
}

/// What changed, as far as the compiled kernel config is concerned.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigChangeReason {
    ProfileUpdated { id: String },
    ActiveProfileChanged { id: String },
    SubscriptionChanged { id: String },
    SubscriptionsUpdated { ids: Vec<String> },
    RulesetChanged { id: String },
    RulesetsUpdated { ids: Vec<String> },
    SettingsUpdated,
}

/// 后台向前端广播的应用级事件。
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    ConfigChanged {
        reason: ConfigChangeReason,
        timestamp: String,
    },
    KernelStatusChanged {
        status: KernelStatus,
        timestamp: String,
    },
}

#[tokio::main]
async fn main() {
    let data_root = app::data_root();
    if let Err(err) = app::init_data_dirs(&data_root) {
        eprintln!(
            "failed to initialize data directories at {}: {err}",
            data_root.display()
        );
        std::process::exit(1);
    }
    init_tracing(&data_root);
    tracing::info!("data directories ready at {}", data_root.display());

    let state = match build_state(data_root) {
        Ok(state) => state,
        Err(err) => {
            tracing::error!("{err}");
            std::process::exit(1);
        }
    };
    if app::init_app_state(state).is_err() {
        tracing::error!("failed to set global application state");
        return;
    }

    tokio::spawn(async {
        if let Err(err) = app_state().plugins.fire(PluginTrigger::OnStartup).await {
            tracing::warn!("on-startup hooks failed: {err}");
        }
        kernel::recover_or_auto_start().await;
    });
    scheduler::start_scheduler();

    let addr = app::server_addr_from_env();
    tracing::info!("starting corepilot at http://{addr}");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!("failed to bind to {addr}: {err}");
            return;
        }
    };

    if let Err(err) = axum::serve(listener, build_router())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("server error: {err}");
    }
    tracing::info!("corepilot stopped");
}

fn build_state(data_root: PathBuf) -> Result<AppState, String> {
    let mut settings = load_app_settings(&data_root)?;
    settings.apply_defaults();

    let http_client = reqwest::ClientBuilder::new()
        .user_agent(concat!("corepilot/", env!("CARGO_PKG_VERSION")))
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|err| format!("failed to build http client: {err}"))?;

    let config_dir = data_root.join("config");
    let profiles = ListStore::load(config_dir.join("profiles.yaml"), STORE_SAVE_DEBOUNCE)?;
    let subscriptions = ListStore::load(config_dir.join("subscriptions.yaml"), STORE_SAVE_DEBOUNCE)?;
    let rulesets = ListStore::load(config_dir.join("rulesets.yaml"), STORE_SAVE_DEBOUNCE)?;
    let plugins = Arc::new(PluginRegistry::load(
        &data_root,
        STORE_SAVE_DEBOUNCE,
        Arc::new(UnavailableRuntime),
    )?);
    plugins.set_user_settings(settings.plugin_settings.clone());

    let (events_tx, _events_rx) = tokio::sync::broadcast::channel(128);

    let hooks: Arc<dyn LifecycleHooks> = plugins.clone();
    let deps = KernelDeps {
        supervisor: Arc::new(TokioSupervisor),
        control: Arc::new(HttpControlApi::new(http_client.clone())),
        system_proxy: Arc::new(NoopSystemProxy),
        hooks,
    };
    let kernel = Arc::new(KernelCoordinator::new(&data_root, deps, events_tx.clone()));

    Ok(AppState {
        data_root,
        http_client,
        settings: std::sync::RwLock::new(settings),
        profiles,
        subscriptions,
        rulesets,
        plugins,
        kernel,
        events_tx,
        shutdown: tokio_util::sync::CancellationToken::new(),
    })
}

/// Ctrl-C or SIGTERM. Background work is cancelled and on-shutdown hooks run
/// before the server drains. The kernel keeps running and is adopted again on
/// the next start.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutting down");
    let state = app_state();
    state.shutdown.cancel();
    if let Err(err) = state.plugins.fire(PluginTrigger::OnShutdown).await {
        tracing::warn!("on-shutdown hooks failed: {err}");
    }
}

fn init_tracing(data_root: &Path) {
    use std::io::{Result as IoResult, Write};
    use tracing_subscriber::fmt::writer::MakeWriter;
    use tracing_subscriber::{fmt, EnvFilter};

    use crate::logs::{new_shared_log_write_state, write_log_with_rotation_and_space_guard, SharedLogWriteState};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    struct FileWriter {
        path: PathBuf,
        state: SharedLogWriteState,
    }

    impl Write for FileWriter {
        fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
            write_log_with_rotation_and_space_guard(&self.path, &self.state, buf, "app")
        }

        fn flush(&mut self) -> IoResult<()> {
            Ok(())
        }
    }

    struct FileMakeWriter {
        path: PathBuf,
        state: SharedLogWriteState,
    }

    impl<'a> MakeWriter<'a> for FileMakeWriter {
        type Writer = FileWriter;

        fn make_writer(&'a self) -> Self::Writer {
            FileWriter {
                path: self.path.clone(),
                state: self.state.clone(),
            }
        }
    }

    fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(FileMakeWriter {
            path: logs::app_log_path(data_root),
            state: new_shared_log_write_state(),
        })
        .init();
}

fn build_router() -> Router {
    let api = Router::new()
        .route("/health", get(health_handler))
        .route("/settings", get(get_settings).put(update_settings))
        .route(
            "/profiles",
            get(profiles::list_profiles).post(profiles::create_profile),
        )
        .route(
            "/profiles/:id",
            get(profiles::get_profile)
                .put(profiles::update_profile)
                .delete(profiles::delete_profile),
        )
        .route("/profiles/:id/activate", post(profiles::activate_profile))
        .route("/profiles/:id/config", get(profiles::preview_profile_config))
        .route(
            "/subscriptions",
            get(subscriptions::list_subscriptions).post(subscriptions::create_subscription),
        )
        .route(
            "/subscriptions/update",
            post(subscriptions::refresh_all_subscriptions),
        )
        .route(
            "/subscriptions/:id",
            get(subscriptions::get_subscription)
                .put(subscriptions::update_subscription)
                .delete(subscriptions::delete_subscription),
        )
        .route(
            "/subscriptions/:id/update",
            post(subscriptions::refresh_subscription),
        )
        .route(
            "/rulesets",
            get(rulesets::list_rulesets).post(rulesets::create_ruleset),
        )
        .route("/rulesets/update", post(rulesets::refresh_all_rulesets))
        .route(
            "/rulesets/:id",
            put(rulesets::update_ruleset).delete(rulesets::delete_ruleset),
        )
        .route("/rulesets/:id/update", post(rulesets::refresh_ruleset))
        .route(
            "/plugins",
            get(plugins::list_plugins).post(plugins::create_plugin),
        )
        .route(
            "/plugins/:id",
            put(plugins::update_plugin).delete(plugins::delete_plugin),
        )
        .route("/plugins/:id/update", post(plugins::refresh_plugin))
        .route("/plugins/:id/run", post(plugins::run_plugin))
        .route("/kernel/status", get(kernel::get_kernel_status))
        .route("/kernel/start", post(kernel::start_kernel_handler))
        .route("/kernel/stop", post(kernel::stop_kernel_handler))
        .route("/kernel/restart", post(kernel::restart_kernel_handler))
        .route("/kernel/proxies", get(kernel::get_kernel_proxies))
        .route(
            "/kernel/configs",
            get(kernel::get_kernel_configs).patch(kernel::patch_kernel_configs),
        )
        .route("/logs/app", get(logs::get_app_log))
        .route("/logs/kernel", get(logs::get_kernel_log))
        .route("/events/ws", get(ws::events_ws));

    Router::new().nest("/api", api)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Body of `PUT /api/settings`. The active profile is changed through
/// `/api/profiles/:id/activate` only.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsUpdate {
    auto_start_kernel: Option<bool>,
    auto_restart_kernel: Option<bool>,
    auto_set_system_proxy: Option<bool>,
    /// An empty string clears the override.
    kernel_binary: Option<String>,
    plugin_settings: Option<BTreeMap<String, BTreeMap<String, JsonValue>>>,
    subscription_auto_update: Option<ScheduledTask>,
    ruleset_auto_update: Option<ScheduledTask>,
}

impl SettingsUpdate {
    fn apply(self, settings: &mut AppSettings) {
        if let Some(v) = self.auto_start_kernel {
            settings.auto_start_kernel = v;
        }
        if let Some(v) = self.auto_restart_kernel {
            settings.auto_restart_kernel = v;
        }
        if let Some(v) = self.auto_set_system_proxy {
            settings.auto_set_system_proxy = v;
        }
        if let Some(v) = self.kernel_binary {
            settings.kernel_binary = Some(v).filter(|p| !p.trim().is_empty());
        }
        if let Some(v) = self.plugin_settings {
            settings.plugin_settings = v;
        }
        if let Some(v) = self.subscription_auto_update {
            settings.subscription_auto_update = Some(v);
        }
        if let Some(v) = self.ruleset_auto_update {
            settings.ruleset_auto_update = Some(v);
        }
    }
}

async fn get_settings() -> Json<ApiResponse<AppSettings>> {
    Json(ApiResponse::ok(get_app_settings_snapshot()))
}

async fn update_settings(Json(body): Json<SettingsUpdate>) -> Json<ApiResponse<AppSettings>> {
    let result = with_app_settings_mut(|settings| {
        body.apply(settings);
        settings.clone()
    });
    match result {
        Ok(settings) => {
            app_state()
                .plugins
                .set_user_settings(settings.plugin_settings.clone());
            kernel::notify_config_change(ConfigChangeReason::SettingsUpdated);
            Json(ApiResponse::ok(settings))
        }
        Err(err) => {
            tracing::error!("failed to save settings: {err}");
            Json(ApiResponse::error("settings_save_failed", err))
        }
    }
}

fn app_settings_path(root: &Path) -> PathBuf {
    root.join("config").join("app.json")
}

pub(crate) fn load_app_settings(root: &Path) -> Result<AppSettings, String> {
    let path = app_settings_path(root);
    match std::fs::read_to_string(&path) {
        Ok(content) => serde_json::from_str(&content)
            .map_err(|err| format!("failed to parse app.json at {}: {err}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(AppSettings::default()),
        Err(err) => Err(format!("failed to read app.json at {}: {err}", path.display())),
    }
}

pub(crate) fn save_app_settings(root: &Path, settings: &AppSettings) -> Result<(), String> {
    let content = serde_json::to_string_pretty(settings)
        .map_err(|err| format!("failed to serialize app settings: {err}"))?;
    store::write_atomic(&app_settings_path(root), content.as_bytes())
}

/// 读取当前全局设置的只读快照。
pub(crate) fn get_app_settings_snapshot() -> AppSettings {
    app_state()
        .settings
        .read()
        .expect("app settings rwlock poisoned")
        .clone()
}

/// Mutates the global settings under the write lock and persists them. A
/// failed write keeps the in-memory change and reports the error.
pub(crate) fn with_app_settings_mut<F, R>(f: F) -> Result<R, String>
where
    F: FnOnce(&mut AppSettings) -> R,
{
    let state = app_state();
    let mut guard = state.settings.write().expect("app settings rwlock poisoned");
    let result = f(&mut guard);
    save_app_settings(&state.data_root, &guard)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip_through_app_json() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_app_settings(dir.path()).unwrap(), AppSettings::default());

        let mut settings = AppSettings {
            active_profile_id: Some("ID_p".to_string()),
            auto_restart_kernel: true,
            ..AppSettings::default()
        };
        settings.apply_defaults();
        save_app_settings(dir.path(), &settings).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("config").join("app.json")).unwrap();
        assert!(raw.contains("\"activeProfileId\": \"ID_p\""));
        assert!(raw.contains("\"autoRestartKernel\": true"));
        assert_eq!(load_app_settings(dir.path()).unwrap(), settings);
    }

    #[test]
    fn partial_update_leaves_other_fields() {
        let mut settings = AppSettings {
            auto_start_kernel: true,
            kernel_binary: Some("/opt/mihomo".to_string()),
            ..AppSettings::default()
        };
        let update: SettingsUpdate =
            serde_json::from_str(r#"{"autoSetSystemProxy": true, "kernelBinary": ""}"#).unwrap();
        update.apply(&mut settings);

        assert!(settings.auto_start_kernel);
        assert!(settings.auto_set_system_proxy);
        assert_eq!(settings.kernel_binary, None);
    }

    #[test]
    fn events_are_tagged() {
        let event = AppEvent::ConfigChanged {
            reason: ConfigChangeReason::RulesetsUpdated { ids: vec!["ID_r".to_string()] },
            timestamp: "t".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "config_changed");
        assert_eq!(json["reason"]["kind"], "rulesets_updated");
        assert_eq!(json["reason"]["ids"][0], "ID_r");
    }
}
