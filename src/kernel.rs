use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::Json;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::app::{app_state, current_timestamp, AppState};
use crate::kernel_api::{
    group_view, snapshot, ControlApi, ControlSnapshot, ControllerEndpoint, ProxyGroupDto, SystemProxy,
};
use crate::logs::kernel_log_path;
use crate::overrides::{write_config, PipelineContext};
use crate::plugins::{PluginError, PluginRegistry, PluginTrigger};
use crate::profiles::Profile;
use crate::rulesets::Ruleset;
use crate::supervisor::{SpawnRequest, SpawnedKernel, Supervisor};
use crate::{ApiResponse, AppEvent, AppSettings, ConfigChangeReason};

/// Printed by the kernel once its controller accepts requests.
pub const READY_MARKER: &str = "RESTful API listening at";
/// Adopted processes only count as the kernel when their name starts with this.
pub const KERNEL_PROCESS_PREFIX: &str = "mihomo";
const OUTPUT_TAIL_LINES: usize = 20;
const ADOPTED_EXIT_POLL: Duration = Duration::from_millis(200);
/// 内核首次启动时可能要下载 GeoIP 等数据，留足时间
const READY_TIMEOUT: Duration = Duration::from_secs(60);
/// How long a stop waits after SIGTERM, and again after SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KernelPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct KernelStatus {
    pub phase: KernelPhase,
    /// Set for the whole stop + start sequence of a restart.
    pub restarting: bool,
    pub needs_restart: bool,
    pub pid: Option<u32>,
}

impl Default for KernelStatus {
    fn default() -> Self {
        Self {
            phase: KernelPhase::Stopped,
            restarting: false,
            needs_restart: false,
            pid: None,
        }
    }
}

impl KernelStatus {
    pub fn state(&self) -> &'static str {
        if self.restarting {
            return "restarting";
        }
        match self.phase {
            KernelPhase::Stopped => "stopped",
            KernelPhase::Starting => "starting",
            KernelPhase::Running => "running",
            KernelPhase::Stopping => "stopping",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("choose a profile first")]
    NoProfileSelected,
    #[error("the kernel is already running")]
    AlreadyRunning,
    #[error("the kernel is already starting")]
    AlreadyStarting,
    #[error("the kernel is not running")]
    NotRunning,
    #[error("another kernel operation is in progress")]
    Busy,
    #[error("failed to prepare kernel start: {0}")]
    Prepare(String),
    #[error("failed to spawn kernel: {0}")]
    Spawn(String),
    #[error("kernel exited before it was ready (code {code:?}): {output}")]
    ExitedBeforeReady { code: Option<i32>, output: String },
    #[error("kernel was not ready after {}s and was killed: {output}", .waited.as_secs())]
    ReadyTimeout { waited: Duration, output: String },
    #[error("failed to stop kernel: {0}")]
    Kill(String),
}

impl KernelError {
    pub fn code(&self) -> &'static str {
        match self {
            KernelError::NoProfileSelected => "no_profile_selected",
            KernelError::AlreadyRunning => "kernel_already_running",
            KernelError::AlreadyStarting => "kernel_already_starting",
            KernelError::NotRunning => "kernel_not_running",
            KernelError::Busy => "kernel_operation_in_progress",
            KernelError::Prepare(_) => "kernel_prepare_failed",
            KernelError::Spawn(_) => "kernel_spawn_failed",
            KernelError::ExitedBeforeReady { .. } => "kernel_exited_before_ready",
            KernelError::ReadyTimeout { .. } => "kernel_ready_timeout",
            KernelError::Kill(_) => "kernel_stop_failed",
        }
    }
}

/// Plugin triggers fired around the kernel's lifetime.
pub trait LifecycleHooks: Send + Sync {
    fn fire(&self, trigger: PluginTrigger) -> BoxFuture<'_, Result<(), PluginError>>;
}

impl LifecycleHooks for PluginRegistry {
    fn fire(&self, trigger: PluginTrigger) -> BoxFuture<'_, Result<(), PluginError>> {
        Box::pin(PluginRegistry::fire(self, trigger))
    }
}

pub struct KernelDeps {
    pub supervisor: Arc<dyn Supervisor>,
    pub control: Arc<dyn ControlApi>,
    pub system_proxy: Arc<dyn SystemProxy>,
    pub hooks: Arc<dyn LifecycleHooks>,
}

/// Everything needed to launch one kernel instance. Built after the phase
/// has moved to Starting.
pub struct LaunchPlan {
    pub spawn: SpawnRequest,
    pub controller: ControllerEndpoint,
    pub mixed_port: u16,
    pub tun_enabled: bool,
    pub auto_system_proxy: bool,
}

pub fn kernel_dir(root: &Path) -> PathBuf {
    root.join("kernel")
}

fn pid_path(root: &Path) -> PathBuf {
    kernel_dir(root).join("kernel.pid")
}

fn read_pid_file(path: &Path) -> Result<u32, String> {
    match std::fs::read_to_string(path) {
        Ok(content) => content
            .trim()
            .parse::<u32>()
            .map_err(|err| format!("invalid pid in {}: {err}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err("pid_file_not_found".to_string()),
        Err(err) => Err(format!("failed to read pid file at {}: {err}", path.display())),
    }
}

fn write_pid_file(path: &Path, pid: u32) -> Result<(), String> {
    crate::store::write_atomic(path, pid.to_string().as_bytes())
}

fn remove_pid_file(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove pid file {}: {err}", path.display());
        }
    }
}

/// Waits for the readiness marker, at most `limit`. Output seen on the way is
/// kept so that an early exit or a timeout can be reported with it.
async fn wait_until_ready(
    lines: &mut mpsc::UnboundedReceiver<String>,
    exited: &mut oneshot::Receiver<Option<i32>>,
    limit: Duration,
) -> Result<(), KernelError> {
    let mut tail: VecDeque<String> = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
    let push = |tail: &mut VecDeque<String>, line: String| {
        if tail.len() == OUTPUT_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    };
    let mut lines_open = true;
    let deadline = tokio::time::sleep(limit);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            line = lines.recv(), if lines_open => match line {
                Some(line) if line.contains(READY_MARKER) => return Ok(()),
                Some(line) => push(&mut tail, line),
                None => lines_open = false,
            },
            code = &mut *exited => {
                while let Ok(line) = lines.try_recv() {
                    push(&mut tail, line);
                }
                return Err(KernelError::ExitedBeforeReady {
                    code: code.ok().flatten(),
                    output: Vec::from(tail).join("\n"),
                });
            }
            _ = &mut deadline => {
                return Err(KernelError::ReadyTimeout {
                    waited: limit,
                    output: Vec::from(tail).join("\n"),
                });
            }
        }
    }
}

/// Owns the kernel's lifecycle. Every phase change is a compare-and-set on
/// the watch channel, so concurrent requests cannot both win.
pub struct KernelCoordinator {
    pid_path: PathBuf,
    deps: KernelDeps,
    status: watch::Sender<KernelStatus>,
    events: broadcast::Sender<AppEvent>,
    controller: RwLock<Option<ControllerEndpoint>>,
    snapshot: RwLock<Option<ControlSnapshot>>,
    /// The running process was spawned by this instance (not adopted).
    owned: AtomicBool,
    /// The system proxy was engaged on start and must be cleared on exit.
    proxy_engaged: AtomicBool,
    ready_timeout: Duration,
    stop_grace: Duration,
}

impl KernelCoordinator {
    pub fn new(data_root: &Path, deps: KernelDeps, events: broadcast::Sender<AppEvent>) -> Self {
        let (status, _) = watch::channel(KernelStatus::default());
        Self {
            pid_path: pid_path(data_root),
            deps,
            status,
            events,
            controller: RwLock::new(None),
            snapshot: RwLock::new(None),
            owned: AtomicBool::new(false),
            proxy_engaged: AtomicBool::new(false),
            ready_timeout: READY_TIMEOUT,
            stop_grace: STOP_GRACE,
        }
    }

    #[cfg(test)]
    fn with_timeouts(mut self, ready: Duration, stop_grace: Duration) -> Self {
        self.ready_timeout = ready;
        self.stop_grace = stop_grace;
        self
    }

    pub fn status(&self) -> KernelStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<KernelStatus> {
        self.status.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.status.borrow().phase == KernelPhase::Running
    }

    pub fn snapshot(&self) -> Option<ControlSnapshot> {
        self.snapshot
            .read()
            .expect("kernel snapshot rwlock poisoned")
            .clone()
    }

    /// Applies `f` and broadcasts the new status when it reports a change.
    fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut KernelStatus) -> bool,
    {
        let changed = self.status.send_if_modified(f);
        if changed {
            let status = self.status();
            tracing::debug!("kernel status: {} (pid {:?})", status.state(), status.pid);
            let event = AppEvent::KernelStatusChanged {
                status,
                timestamp: current_timestamp(),
            };
            if let Err(err) = self.events.send(event) {
                tracing::debug!("no listeners for KernelStatusChanged: {err}");
            }
        }
        changed
    }

    fn kernel_alive(&self, pid: u32) -> bool {
        self.deps
            .supervisor
            .process_name(pid)
            .is_some_and(|name| name.starts_with(KERNEL_PROCESS_PREFIX))
    }

    pub async fn start<F, Fut>(self: &Arc<Self>, prepare: F) -> Result<u32, KernelError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<LaunchPlan, KernelError>>,
    {
        let mut rejected = None;
        self.update(|s| match s.phase {
            KernelPhase::Stopped => {
                s.phase = KernelPhase::Starting;
                true
            }
            KernelPhase::Running => {
                rejected = Some(KernelError::AlreadyRunning);
                false
            }
            KernelPhase::Starting => {
                rejected = Some(KernelError::AlreadyStarting);
                false
            }
            KernelPhase::Stopping => {
                rejected = Some(KernelError::Busy);
                false
            }
        });
        if let Some(err) = rejected {
            return Err(err);
        }

        match self.launch(prepare).await {
            Ok(pid) => Ok(pid),
            Err(err) => {
                tracing::error!("kernel start failed: {err}");
                self.update(|s| {
                    s.phase = KernelPhase::Stopped;
                    s.pid = None;
                    true
                });
                Err(err)
            }
        }
    }

    async fn launch<F, Fut>(self: &Arc<Self>, prepare: F) -> Result<u32, KernelError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<LaunchPlan, KernelError>>,
    {
        let plan = prepare().await?;
        let SpawnedKernel {
            pid,
            mut lines,
            mut exited,
        } = self
            .deps
            .supervisor
            .spawn(&plan.spawn)
            .map_err(KernelError::Spawn)?;

        if let Err(err) = wait_until_ready(&mut lines, &mut exited, self.ready_timeout).await {
            if matches!(err, KernelError::ReadyTimeout { .. }) {
                self.abandon(pid, exited).await;
            }
            return Err(err);
        }
        drop(lines);

        self.owned.store(true, Ordering::SeqCst);
        self.on_running(pid, &plan).await;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let code = exited.await.ok().flatten();
            tracing::info!("kernel {pid} is gone (code {code:?})");
            this.on_exit(pid).await;
        });

        tracing::info!("kernel started with pid {pid}");
        Ok(pid)
    }

    /// Kills a kernel that never became ready and waits briefly for it.
    async fn abandon(&self, pid: u32, exited: oneshot::Receiver<Option<i32>>) {
        tracing::warn!("kernel {pid} did not become ready within {:?}", self.ready_timeout);
        if let Err(err) = self.deps.supervisor.force_kill(pid) {
            tracing::error!("failed to kill unready kernel {pid}: {err}");
            return;
        }
        if tokio::time::timeout(self.stop_grace, exited).await.is_err() {
            tracing::error!("kernel {pid} is still alive after SIGKILL");
        }
    }

    async fn on_running(&self, pid: u32, plan: &LaunchPlan) {
        if let Err(err) = write_pid_file(&self.pid_path, pid) {
            tracing::error!("{err}");
        }
        *self.controller.write().expect("kernel controller rwlock poisoned") = Some(plan.controller.clone());
        self.update(|s| {
            s.phase = KernelPhase::Running;
            s.pid = Some(pid);
            s.needs_restart = false;
            true
        });

        self.refresh_snapshot(&plan.controller).await;

        if plan.auto_system_proxy && !plan.tun_enabled {
            match self.deps.system_proxy.set(plan.mixed_port) {
                Ok(()) => self.proxy_engaged.store(true, Ordering::SeqCst),
                Err(err) => tracing::warn!("failed to set system proxy: {err}"),
            }
        }

        if let Err(err) = self.deps.hooks.fire(PluginTrigger::OnCoreStarted).await {
            tracing::warn!("on-core-started hook failed: {err}");
        }
    }

    async fn refresh_snapshot(&self, controller: &ControllerEndpoint) {
        match snapshot(self.deps.control.as_ref(), controller).await {
            Ok(snap) => {
                *self.snapshot.write().expect("kernel snapshot rwlock poisoned") = Some(snap);
            }
            Err(err) => tracing::warn!("failed to read kernel state after start: {err}"),
        }
    }

    /// Cleanup once `pid` is gone. Does nothing when the status already moved
    /// past that process.
    async fn on_exit(&self, pid: u32) {
        if self.status.borrow().pid != Some(pid) {
            tracing::debug!("exit of kernel {pid} was already handled");
            return;
        }
        if self.proxy_engaged.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.deps.system_proxy.clear() {
                tracing::warn!("failed to clear system proxy: {err}");
            }
        }
        remove_pid_file(&self.pid_path);
        *self.snapshot.write().expect("kernel snapshot rwlock poisoned") = None;
        self.owned.store(false, Ordering::SeqCst);

        if let Err(err) = self.deps.hooks.fire(PluginTrigger::OnCoreStopped).await {
            tracing::warn!("on-core-stopped hook failed: {err}");
        }

        self.update(|s| {
            s.phase = KernelPhase::Stopped;
            s.pid = None;
            s.needs_restart = false;
            true
        });
    }

    /// Stops the kernel and returns once it is really gone.
    pub async fn stop(&self) -> Result<(), KernelError> {
        let mut claimed = None;
        let mut rejected = None;
        self.update(|s| match (s.phase, s.pid) {
            (KernelPhase::Running, Some(pid)) => {
                s.phase = KernelPhase::Stopping;
                claimed = Some(pid);
                true
            }
            (KernelPhase::Stopped, _) | (KernelPhase::Running, None) => {
                rejected = Some(KernelError::NotRunning);
                false
            }
            _ => {
                rejected = Some(KernelError::Busy);
                false
            }
        });
        if let Some(err) = rejected {
            return Err(err);
        }
        let Some(pid) = claimed else {
            return Err(KernelError::NotRunning);
        };

        if let Err(err) = self.deps.hooks.fire(PluginTrigger::BeforeCoreStop).await {
            tracing::warn!("before-core-stop hook failed: {err}");
        }

        let mut status = self.status.subscribe();
        if let Err(err) = self.deps.supervisor.kill(pid) {
            self.update(|s| {
                if s.phase != KernelPhase::Stopping {
                    return false;
                }
                s.phase = KernelPhase::Running;
                true
            });
            return Err(KernelError::Kill(err));
        }

        let owned = self.owned.load(Ordering::SeqCst);
        let mut gone = self.wait_for_exit(pid, owned, &mut status).await;
        if !gone {
            tracing::warn!("kernel {pid} ignored SIGTERM for {:?}", self.stop_grace);
            if let Err(err) = self.deps.supervisor.force_kill(pid) {
                tracing::error!("failed to kill kernel {pid}: {err}");
            }
            gone = self.wait_for_exit(pid, owned, &mut status).await;
            if !gone {
                tracing::error!("kernel {pid} is still alive after SIGKILL, marking it stopped");
            }
        }
        // owned kernels are cleaned up by their exit watcher
        if !owned || !gone {
            self.on_exit(pid).await;
        }

        tracing::info!("kernel {pid} stopped");
        Ok(())
    }

    /// True once `pid` is gone, false after the stop grace period.
    async fn wait_for_exit(&self, pid: u32, owned: bool, status: &mut watch::Receiver<KernelStatus>) -> bool {
        if owned {
            let stopped = status.wait_for(|s| s.phase == KernelPhase::Stopped);
            return matches!(tokio::time::timeout(self.stop_grace, stopped).await, Ok(Ok(_)));
        }

        let deadline = tokio::time::Instant::now() + self.stop_grace;
        while self.kernel_alive(pid) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(ADOPTED_EXIT_POLL).await;
        }
        true
    }

    /// Stop (when running) then start. Restarting from Stopped just starts.
    pub async fn restart<F, Fut>(self: &Arc<Self>, prepare: F) -> Result<u32, KernelError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<LaunchPlan, KernelError>>,
    {
        let mut claimed = false;
        self.update(|s| {
            if s.restarting {
                return false;
            }
            s.restarting = true;
            claimed = true;
            true
        });
        if !claimed {
            return Err(KernelError::Busy);
        }

        let result = async {
            match self.status().phase {
                KernelPhase::Running => self.stop().await?,
                KernelPhase::Stopped => {}
                KernelPhase::Starting | KernelPhase::Stopping => return Err(KernelError::Busy),
            }
            self.start(prepare).await
        }
        .await;

        self.update(|s| {
            s.restarting = false;
            s.needs_restart = false;
            true
        });
        result
    }

    /// Picks up a kernel left running by an earlier instance, recorded in the
    /// pid file. Stale pid files are removed.
    pub async fn adopt_running(&self, controller: Option<ControllerEndpoint>) -> Option<u32> {
        let pid = match read_pid_file(&self.pid_path) {
            Ok(pid) => pid,
            Err(reason) => {
                if reason != "pid_file_not_found" {
                    tracing::warn!("failed to read kernel pid: {reason}");
                    remove_pid_file(&self.pid_path);
                }
                return None;
            }
        };
        if !self.kernel_alive(pid) {
            remove_pid_file(&self.pid_path);
            return None;
        }

        self.owned.store(false, Ordering::SeqCst);
        *self.controller.write().expect("kernel controller rwlock poisoned") = controller.clone();
        let adopted = self.update(|s| {
            if s.phase != KernelPhase::Stopped {
                return false;
            }
            s.phase = KernelPhase::Running;
            s.pid = Some(pid);
            true
        });
        if !adopted {
            return None;
        }

        tracing::info!("kernel is already running with pid {pid}");
        if let Some(controller) = controller {
            self.refresh_snapshot(&controller).await;
        }
        Some(pid)
    }

    /// Flags the running kernel as out of date. Returns false when the
    /// kernel is not running.
    pub fn mark_needs_restart(&self) -> bool {
        self.update(|s| {
            if s.phase != KernelPhase::Running || s.needs_restart {
                return false;
            }
            s.needs_restart = true;
            true
        });
        let status = self.status();
        status.phase == KernelPhase::Running && status.needs_restart
    }

    fn controller(&self) -> Result<ControllerEndpoint, KernelError> {
        if !self.is_running() {
            return Err(KernelError::NotRunning);
        }
        self.controller
            .read()
            .expect("kernel controller rwlock poisoned")
            .clone()
            .ok_or(KernelError::NotRunning)
    }

    /// Live `GET /proxies`; the stored snapshot is refreshed on success.
    pub async fn fetch_proxies(&self) -> Result<JsonValue, String> {
        let controller = self.controller().map_err(|err| err.to_string())?;
        let proxies = self.deps.control.get(&controller, "/proxies").await?;
        if let Some(snap) = self
            .snapshot
            .write()
            .expect("kernel snapshot rwlock poisoned")
            .as_mut()
        {
            snap.proxies = proxies.clone();
        }
        Ok(proxies)
    }

    pub async fn patch_configs(&self, body: JsonValue) -> Result<(), String> {
        let controller = self.controller().map_err(|err| err.to_string())?;
        self.deps.control.patch(&controller, "/configs", body).await?;
        match self.deps.control.get(&controller, "/configs").await {
            Ok(configs) => {
                if let Some(snap) = self
                    .snapshot
                    .write()
                    .expect("kernel snapshot rwlock poisoned")
                    .as_mut()
                {
                    snap.configs = configs;
                }
            }
            Err(err) => tracing::warn!("failed to re-read kernel configs: {err}"),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// App wiring

/// Settings, then `COREPILOT_KERNEL`, then `<root>/kernel/mihomo`.
pub fn kernel_binary(settings: &AppSettings, root: &Path) -> PathBuf {
    settings
        .kernel_binary
        .as_ref()
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("COREPILOT_KERNEL").map(PathBuf::from))
        .unwrap_or_else(|| kernel_dir(root).join("mihomo"))
}

pub fn active_profile(state: &AppState) -> Option<Profile> {
    let settings = crate::get_app_settings_snapshot();
    settings
        .active_profile_id
        .as_deref()
        .and_then(|id| state.profiles.get(id))
}

async fn prepare_launch(state: &'static AppState) -> Result<LaunchPlan, KernelError> {
    let settings = crate::get_app_settings_snapshot();
    let profile = active_profile(state).ok_or(KernelError::NoProfileSelected)?;

    let binary = kernel_binary(&settings, &state.data_root);
    if !binary.is_file() {
        return Err(KernelError::Prepare(format!(
            "kernel binary not found at {}",
            binary.display()
        )));
    }

    let ctx = PipelineContext::from_app(state);
    let config_file = write_config(&profile, &ctx)
        .await
        .map_err(|err| KernelError::Prepare(err.to_string()))?;

    Ok(LaunchPlan {
        spawn: SpawnRequest {
            binary,
            work_dir: kernel_dir(&state.data_root),
            config_file,
            log_path: kernel_log_path(&state.data_root),
        },
        controller: ControllerEndpoint::from_config(&profile.advanced_config),
        mixed_port: profile.general_config.mixed_port,
        tun_enabled: profile.tun_config.enable,
        auto_system_proxy: settings.auto_set_system_proxy,
    })
}

pub async fn start_kernel() -> Result<u32, KernelError> {
    let state = app_state();
    state.kernel.start(|| prepare_launch(state)).await
}

pub async fn restart_kernel() -> Result<u32, KernelError> {
    let state = app_state();
    state.kernel.restart(|| prepare_launch(state)).await
}

/// Does `reason` affect what `profile` compiles to?
pub fn change_touches_profile(reason: &ConfigChangeReason, profile: &Profile, rulesets: &[Ruleset]) -> bool {
    let uses_ruleset = |id: &str| {
        let refs = profile.referenced_rulesets();
        let name = rulesets.iter().find(|r| r.id == id).map(|r| r.name.as_str());
        refs.iter()
            .any(|r| r == id || Some(r.as_str()) == name)
    };

    match reason {
        ConfigChangeReason::ActiveProfileChanged { .. } => true,
        ConfigChangeReason::ProfileUpdated { id } => *id == profile.id,
        ConfigChangeReason::SubscriptionChanged { id } => profile.uses_subscription(id),
        ConfigChangeReason::SubscriptionsUpdated { ids } => ids.iter().any(|id| profile.uses_subscription(id)),
        ConfigChangeReason::RulesetChanged { id } => uses_ruleset(id),
        ConfigChangeReason::RulesetsUpdated { ids } => ids.iter().any(|id| uses_ruleset(id)),
        ConfigChangeReason::SettingsUpdated => false,
    }
}

/// Raises needs-restart when a change touches the running profile, and
/// restarts right away when the user opted into it.
pub fn notify_config_change(reason: ConfigChangeReason) {
    let state = app_state();
    let settings = crate::get_app_settings_snapshot();

    let touches = active_profile(state)
        .is_some_and(|profile| change_touches_profile(&reason, &profile, &state.rulesets.snapshot()));
    tracing::debug!("config change {reason:?}, touches active profile: {touches}");

    let event = AppEvent::ConfigChanged {
        reason,
        timestamp: current_timestamp(),
    };
    if let Err(err) = state.events_tx.send(event) {
        tracing::debug!("no listeners for ConfigChanged: {err}");
    }

    if !touches || !state.kernel.mark_needs_restart() {
        return;
    }
    tracing::info!("the running kernel config is out of date");

    if settings.auto_restart_kernel {
        tokio::spawn(async {
            match restart_kernel().await {
                Ok(pid) => tracing::info!("kernel restarted with pid {pid} after config change"),
                Err(err) => tracing::error!("automatic kernel restart failed: {err}"),
            }
        });
    }
}

/// 启动时：接管已在运行的内核，否则按设置自动启动。
pub async fn recover_or_auto_start() {
    let state = app_state();
    let controller = active_profile(state).map(|p| ControllerEndpoint::from_config(&p.advanced_config));
    if state.kernel.adopt_running(controller).await.is_some() {
        return;
    }

    if !crate::get_app_settings_snapshot().auto_start_kernel {
        return;
    }
    tracing::info!("auto-starting kernel");
    if let Err(err) = start_kernel().await {
        tracing::error!("failed to auto-start kernel: {err}");
    }
}

// ---------------------------------------------------------------------------
// HTTP handlers

#[derive(Serialize)]
pub struct KernelStatusDto {
    pub state: &'static str,
    #[serde(flatten)]
    pub status: KernelStatus,
}

impl From<KernelStatus> for KernelStatusDto {
    fn from(status: KernelStatus) -> Self {
        Self {
            state: status.state(),
            status,
        }
    }
}

fn kernel_result(result: Result<JsonValue, KernelError>) -> Json<ApiResponse<JsonValue>> {
    match result {
        Ok(data) => Json(ApiResponse::ok(data)),
        Err(err) => {
            tracing::warn!("kernel operation failed: {err}");
            Json(ApiResponse::error(err.code(), err.to_string()))
        }
    }
}

pub async fn get_kernel_status() -> Json<ApiResponse<KernelStatusDto>> {
    Json(ApiResponse::ok(app_state().kernel.status().into()))
}

pub async fn start_kernel_handler() -> Json<ApiResponse<JsonValue>> {
    kernel_result(start_kernel().await.map(|pid| serde_json::json!({ "pid": pid })))
}

pub async fn stop_kernel_handler() -> Json<ApiResponse<JsonValue>> {
    kernel_result(app_state().kernel.stop().await.map(|_| serde_json::json!({})))
}

pub async fn restart_kernel_handler() -> Json<ApiResponse<JsonValue>> {
    kernel_result(restart_kernel().await.map(|pid| serde_json::json!({ "pid": pid })))
}

pub async fn get_kernel_proxies() -> Json<ApiResponse<Vec<ProxyGroupDto>>> {
    let kernel = &app_state().kernel;
    let proxies = match kernel.fetch_proxies().await {
        Ok(proxies) => proxies,
        Err(err) => {
            tracing::warn!("failed to fetch kernel proxies: {err}");
            match kernel.snapshot() {
                Some(snap) => snap.proxies,
                None => return Json(ApiResponse::error("kernel_proxies_unavailable", err)),
            }
        }
    };

    match group_view(&proxies) {
        Ok(groups) => Json(ApiResponse::ok(groups)),
        Err(err) => Json(ApiResponse::error("kernel_proxies_invalid", err)),
    }
}

pub async fn get_kernel_configs() -> Json<ApiResponse<JsonValue>> {
    match app_state().kernel.snapshot() {
        Some(snap) => Json(ApiResponse::ok(snap.configs)),
        None => Json(ApiResponse::error("kernel_not_running", "the kernel is not running")),
    }
}

pub async fn patch_kernel_configs(Json(body): Json<JsonValue>) -> Json<ApiResponse<JsonValue>> {
    match app_state().kernel.patch_configs(body).await {
        Ok(()) => Json(ApiResponse::ok(serde_json::json!({}))),
        Err(err) => {
            tracing::warn!("failed to patch kernel configs: {err}");
            Json(ApiResponse::error("kernel_patch_failed", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Hands out scripted kernels: each spawn prints the given lines and,
    /// when `exit_early` is set, exits right after. A `stubborn` kernel only
    /// dies on `force_kill`.
    struct FakeSupervisor {
        spawns: AtomicUsize,
        force_kills: AtomicUsize,
        output: Vec<String>,
        exit_early: bool,
        stubborn: bool,
        alive: Mutex<Vec<u32>>,
        exits: Mutex<Vec<oneshot::Sender<Option<i32>>>>,
        // keep the senders alive so `lines` does not close under the test
        line_senders: Mutex<Vec<mpsc::UnboundedSender<String>>>,
    }

    impl FakeSupervisor {
        fn new(output: &[&str], exit_early: bool) -> Self {
            Self {
                spawns: AtomicUsize::new(0),
                force_kills: AtomicUsize::new(0),
                output: output.iter().map(|s| s.to_string()).collect(),
                exit_early,
                stubborn: false,
                alive: Mutex::new(Vec::new()),
                exits: Mutex::new(Vec::new()),
                line_senders: Mutex::new(Vec::new()),
            }
        }

        fn ready() -> Self {
            Self::new(&["booting", "RESTful API listening at: 127.0.0.1:20113"], false)
        }

        fn silent() -> Self {
            Self::new(&["booting"], false)
        }

        fn stubborn() -> Self {
            Self {
                stubborn: true,
                ..Self::ready()
            }
        }

        fn terminate(&self, pid: u32) {
            self.alive.lock().unwrap().retain(|p| *p != pid);
            if let Some(tx) = self.exits.lock().unwrap().pop() {
                let _ = tx.send(Some(0));
            }
        }

        /// Prints the readiness marker on every kernel still waiting for it.
        fn announce_ready(&self) {
            for tx in self.line_senders.lock().unwrap().iter() {
                let _ = tx.send(READY_MARKER.to_string());
            }
        }
    }

    impl Supervisor for FakeSupervisor {
        fn spawn(&self, _request: &SpawnRequest) -> Result<SpawnedKernel, String> {
            let n = self.spawns.fetch_add(1, Ordering::SeqCst) as u32;
            let pid = 4000 + n;
            let (lines_tx, lines) = mpsc::unbounded_channel();
            for line in &self.output {
                lines_tx.send(line.clone()).unwrap();
            }
            let (exit_tx, exited) = oneshot::channel();
            if self.exit_early {
                drop(lines_tx);
                exit_tx.send(Some(1)).unwrap();
            } else {
                self.alive.lock().unwrap().push(pid);
                self.exits.lock().unwrap().push(exit_tx);
                self.line_senders.lock().unwrap().push(lines_tx);
            }
            Ok(SpawnedKernel { pid, lines, exited })
        }

        fn kill(&self, pid: u32) -> Result<(), String> {
            if !self.stubborn {
                self.terminate(pid);
            }
            Ok(())
        }

        fn force_kill(&self, pid: u32) -> Result<(), String> {
            self.force_kills.fetch_add(1, Ordering::SeqCst);
            self.terminate(pid);
            Ok(())
        }

        fn process_name(&self, pid: u32) -> Option<String> {
            self.alive
                .lock()
                .unwrap()
                .contains(&pid)
                .then(|| "mihomo".to_string())
        }
    }

    struct FakeControl;

    impl ControlApi for FakeControl {
        fn get<'a>(
            &'a self,
            _endpoint: &'a ControllerEndpoint,
            path: &'a str,
        ) -> BoxFuture<'a, Result<JsonValue, String>> {
            Box::pin(async move { Ok(serde_json::json!({ "path": path })) })
        }

        fn patch<'a>(
            &'a self,
            _endpoint: &'a ControllerEndpoint,
            _path: &'a str,
            _body: JsonValue,
        ) -> BoxFuture<'a, Result<(), String>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        fired: Mutex<Vec<PluginTrigger>>,
    }

    impl LifecycleHooks for RecordingHooks {
        fn fire(&self, trigger: PluginTrigger) -> BoxFuture<'_, Result<(), PluginError>> {
            self.fired.lock().unwrap().push(trigger);
            Box::pin(async { Ok(()) })
        }
    }

    #[derive(Default)]
    struct RecordingProxy {
        engaged: Mutex<Option<u16>>,
    }

    impl SystemProxy for RecordingProxy {
        fn set(&self, mixed_port: u16) -> Result<(), String> {
            *self.engaged.lock().unwrap() = Some(mixed_port);
            Ok(())
        }

        fn clear(&self) -> Result<(), String> {
            *self.engaged.lock().unwrap() = None;
            Ok(())
        }
    }

    struct Harness {
        kernel: Arc<KernelCoordinator>,
        supervisor: Arc<FakeSupervisor>,
        hooks: Arc<RecordingHooks>,
        proxy: Arc<RecordingProxy>,
        root: tempfile::TempDir,
    }

    fn harness(supervisor: FakeSupervisor) -> Harness {
        harness_with_timeouts(supervisor, READY_TIMEOUT, STOP_GRACE)
    }

    fn harness_with_timeouts(supervisor: FakeSupervisor, ready: Duration, stop_grace: Duration) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(supervisor);
        let hooks = Arc::new(RecordingHooks::default());
        let proxy = Arc::new(RecordingProxy::default());
        let (events, _) = broadcast::channel(16);
        let deps = KernelDeps {
            supervisor: supervisor.clone(),
            control: Arc::new(FakeControl),
            system_proxy: proxy.clone(),
            hooks: hooks.clone(),
        };
        let kernel = Arc::new(KernelCoordinator::new(root.path(), deps, events).with_timeouts(ready, stop_grace));
        Harness {
            kernel,
            supervisor,
            hooks,
            proxy,
            root,
        }
    }

    fn plan(root: &Path, auto_system_proxy: bool) -> LaunchPlan {
        LaunchPlan {
            spawn: SpawnRequest {
                binary: root.join("kernel").join("mihomo"),
                work_dir: root.join("kernel"),
                config_file: root.join("kernel").join("config.yaml"),
                log_path: root.join("log").join("kernel.log"),
            },
            controller: ControllerEndpoint {
                base_url: "http://127.0.0.1:20113".to_string(),
                secret: "secret".to_string(),
            },
            mixed_port: 20112,
            tun_enabled: false,
            auto_system_proxy,
        }
    }

    #[tokio::test]
    async fn start_reaches_running_with_side_effects() {
        let h = harness(FakeSupervisor::ready());
        let root = h.root.path().to_path_buf();

        let pid = h.kernel.start(|| async { Ok(plan(&root, true)) }).await.unwrap();

        let status = h.kernel.status();
        assert_eq!(status.phase, KernelPhase::Running);
        assert_eq!(status.pid, Some(pid));
        assert_eq!(read_pid_file(&pid_path(&root)).unwrap(), pid);
        assert_eq!(*h.proxy.engaged.lock().unwrap(), Some(20112));
        assert_eq!(h.hooks.fired.lock().unwrap().as_slice(), &[PluginTrigger::OnCoreStarted]);
        let snap = h.kernel.snapshot().unwrap();
        assert_eq!(snap.configs["path"], "/configs");
        assert_eq!(snap.proxies["path"], "/proxies");
    }

    #[tokio::test]
    async fn second_start_is_rejected_without_spawning() {
        let h = harness(FakeSupervisor::ready());
        let root = h.root.path().to_path_buf();
        h.kernel.start(|| async { Ok(plan(&root, false)) }).await.unwrap();

        let err = h
            .kernel
            .start(|| async { Ok(plan(&root, false)) })
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::AlreadyRunning));
        assert_eq!(h.supervisor.spawns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_is_rejected_while_first_is_still_starting() {
        let h = harness(FakeSupervisor::silent());
        let root = h.root.path().to_path_buf();

        let first = {
            let kernel = h.kernel.clone();
            let root = root.clone();
            tokio::spawn(async move { kernel.start(|| async move { Ok(plan(&root, false)) }).await })
        };
        let mut status = h.kernel.subscribe();
        status
            .wait_for(|s| s.phase == KernelPhase::Starting)
            .await
            .unwrap();
        while h.supervisor.spawns.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let err = h
            .kernel
            .start(|| async { Ok(plan(&root, false)) })
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::AlreadyStarting));
        assert!(matches!(h.kernel.stop().await, Err(KernelError::Busy)));

        h.supervisor.announce_ready();
        let pid = first.await.unwrap().unwrap();
        assert_eq!(h.kernel.status().pid, Some(pid));
        assert_eq!(h.supervisor.spawns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn silent_kernel_is_killed_after_ready_timeout() {
        let h = harness_with_timeouts(
            FakeSupervisor::silent(),
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        let root = h.root.path().to_path_buf();

        let err = h
            .kernel
            .start(|| async { Ok(plan(&root, false)) })
            .await
            .unwrap_err();
        match err {
            KernelError::ReadyTimeout { output, .. } => assert_eq!(output, "booting"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.kernel.status(), KernelStatus::default());
        assert_eq!(h.supervisor.force_kills.load(Ordering::SeqCst), 1);
        assert!(h.supervisor.alive.lock().unwrap().is_empty());
        assert!(!pid_path(&root).exists());

        // not stuck: the next request is answered normally
        assert!(matches!(h.kernel.stop().await, Err(KernelError::NotRunning)));
    }

    #[tokio::test]
    async fn kernel_ignoring_sigterm_is_force_killed() {
        let h = harness_with_timeouts(
            FakeSupervisor::stubborn(),
            READY_TIMEOUT,
            Duration::from_millis(50),
        );
        let root = h.root.path().to_path_buf();
        h.kernel.start(|| async { Ok(plan(&root, true)) }).await.unwrap();

        h.kernel.stop().await.unwrap();

        assert_eq!(h.kernel.status().phase, KernelPhase::Stopped);
        assert_eq!(h.supervisor.force_kills.load(Ordering::SeqCst), 1);
        assert!(!pid_path(&root).exists());
        assert_eq!(*h.proxy.engaged.lock().unwrap(), None);
        let fired = h.hooks.fired.lock().unwrap().clone();
        assert_eq!(
            fired.iter().filter(|t| **t == PluginTrigger::OnCoreStopped).count(),
            1
        );
    }

    #[tokio::test]
    async fn adopted_kernel_ignoring_sigterm_is_force_killed() {
        let h = harness_with_timeouts(
            FakeSupervisor::stubborn(),
            READY_TIMEOUT,
            Duration::from_millis(50),
        );
        let root = h.root.path().to_path_buf();
        write_pid_file(&pid_path(&root), 778).unwrap();
        h.supervisor.alive.lock().unwrap().push(778);
        assert_eq!(h.kernel.adopt_running(None).await, Some(778));

        h.kernel.stop().await.unwrap();

        assert_eq!(h.kernel.status().phase, KernelPhase::Stopped);
        assert_eq!(h.supervisor.force_kills.load(Ordering::SeqCst), 1);
        assert!(h.supervisor.alive.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn early_exit_reports_output_and_resets() {
        let h = harness(FakeSupervisor::new(&["parse config error: bad rule"], true));
        let root = h.root.path().to_path_buf();

        let err = h
            .kernel
            .start(|| async { Ok(plan(&root, false)) })
            .await
            .unwrap_err();
        match err {
            KernelError::ExitedBeforeReady { code, output } => {
                assert_eq!(code, Some(1));
                assert!(output.contains("bad rule"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.kernel.status().phase, KernelPhase::Stopped);
        assert!(!pid_path(&root).exists());
    }

    #[tokio::test]
    async fn failed_preparation_leaves_kernel_stopped() {
        let h = harness(FakeSupervisor::ready());
        let err = h
            .kernel
            .start(|| async { Err(KernelError::NoProfileSelected) })
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::NoProfileSelected));
        assert_eq!(h.kernel.status(), KernelStatus::default());
        assert_eq!(h.supervisor.spawns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_waits_for_exit_and_cleans_up() {
        let h = harness(FakeSupervisor::ready());
        let root = h.root.path().to_path_buf();
        h.kernel.start(|| async { Ok(plan(&root, true)) }).await.unwrap();

        h.kernel.stop().await.unwrap();

        assert_eq!(h.kernel.status().phase, KernelPhase::Stopped);
        assert!(!pid_path(&root).exists());
        assert_eq!(*h.proxy.engaged.lock().unwrap(), None);
        assert!(h.kernel.snapshot().is_none());
        assert_eq!(
            h.hooks.fired.lock().unwrap().as_slice(),
            &[
                PluginTrigger::OnCoreStarted,
                PluginTrigger::BeforeCoreStop,
                PluginTrigger::OnCoreStopped
            ]
        );
        assert!(matches!(h.kernel.stop().await, Err(KernelError::NotRunning)));
    }

    #[tokio::test]
    async fn restart_spawns_a_fresh_process_and_clears_flags() {
        let h = harness(FakeSupervisor::ready());
        let root = h.root.path().to_path_buf();
        let first = h.kernel.start(|| async { Ok(plan(&root, false)) }).await.unwrap();
        assert!(h.kernel.mark_needs_restart());

        let second = h.kernel.restart(|| async { Ok(plan(&root, false)) }).await.unwrap();

        assert_ne!(first, second);
        let status = h.kernel.status();
        assert_eq!(status.phase, KernelPhase::Running);
        assert!(!status.restarting);
        assert!(!status.needs_restart);
    }

    #[tokio::test]
    async fn restart_from_stopped_just_starts() {
        let h = harness(FakeSupervisor::ready());
        let root = h.root.path().to_path_buf();
        h.kernel.restart(|| async { Ok(plan(&root, false)) }).await.unwrap();
        assert!(h.kernel.is_running());
        assert_eq!(h.supervisor.spawns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn adopted_kernel_is_stopped_by_polling() {
        let h = harness(FakeSupervisor::ready());
        let root = h.root.path().to_path_buf();
        write_pid_file(&pid_path(&root), 777).unwrap();
        h.supervisor.alive.lock().unwrap().push(777);

        assert_eq!(h.kernel.adopt_running(None).await, Some(777));
        assert!(h.kernel.is_running());

        h.kernel.stop().await.unwrap();
        assert_eq!(h.kernel.status().phase, KernelPhase::Stopped);
        assert!(!pid_path(&root).exists());
    }

    #[tokio::test]
    async fn stale_pid_file_is_removed() {
        let h = harness(FakeSupervisor::ready());
        let root = h.root.path().to_path_buf();
        write_pid_file(&pid_path(&root), 999).unwrap();

        assert_eq!(h.kernel.adopt_running(None).await, None);
        assert!(!pid_path(&root).exists());
        assert!(!h.kernel.is_running());
    }

    #[test]
    fn needs_restart_only_while_running() {
        let h = harness(FakeSupervisor::ready());
        assert!(!h.kernel.mark_needs_restart());
        assert!(!h.kernel.status().needs_restart);
    }

    #[test]
    fn changes_touch_profile_through_groups_and_rules() {
        use crate::profiles::{GroupMember, Rule, RuleType, RulesetFormat};
        use crate::rulesets::RulesetKind;

        let mut profile = Profile::with_defaults("Default");
        profile.proxy_groups_config[0]
            .proxies
            .push(GroupMember::proxy("ID_sub", "ID_p", "HK 01"));
        let ruleset = Ruleset::new("ads", RulesetKind::Manual, RulesetFormat::Yaml, "");
        profile
            .dns_config
            .nameserver_policy
            .insert("rule-set:ads".to_string(), "223.5.5.5".to_string());
        let rulesets = vec![ruleset.clone()];

        let touches = |reason: ConfigChangeReason| change_touches_profile(&reason, &profile, &rulesets);
        assert!(touches(ConfigChangeReason::SubscriptionChanged { id: "ID_sub".to_string() }));
        assert!(!touches(ConfigChangeReason::SubscriptionChanged { id: "ID_other".to_string() }));
        assert!(touches(ConfigChangeReason::RulesetsUpdated { ids: vec![ruleset.id.clone()] }));
        assert!(touches(ConfigChangeReason::ProfileUpdated { id: profile.id.clone() }));
        assert!(!touches(ConfigChangeReason::ProfileUpdated { id: "ID_x".to_string() }));
        assert!(!touches(ConfigChangeReason::SettingsUpdated));

        let mut by_id = profile.clone();
        by_id.dns_config.nameserver_policy.clear();
        let mut rule = Rule::new(RuleType::RuleSet, &ruleset.id, "DIRECT");
        rule.ruleset_type = crate::profiles::RulesetSourceKind::File;
        by_id.rules_config.push(rule);
        assert!(change_touches_profile(
            &ConfigChangeReason::RulesetChanged { id: ruleset.id.clone() },
            &by_id,
            &rulesets
        ));
    }
}
