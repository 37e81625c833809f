use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::kernel::KernelCoordinator;
use crate::plugins::PluginRegistry;
use crate::profiles::Profile;
use crate::rulesets::Ruleset;
use crate::store::ListStore;
use crate::subscriptions::Subscription;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3010;

/// Sub-directories created under the data root at startup.
const DATA_DIRS: [&str; 6] = ["config", "kernel", "log", "subscriptions", "rulesets", "plugins"];

pub struct AppState {
    pub data_root: PathBuf,
    pub http_client: reqwest::Client,
    /// 全局应用设置，进程内唯一真相源。
    /// 启动时从 app.json 加载一次，之后的读写都经过内存。
    pub settings: std::sync::RwLock<crate::AppSettings>,
    pub profiles: ListStore<Profile>,
    pub subscriptions: ListStore<Subscription>,
    pub rulesets: ListStore<Ruleset>,
    pub plugins: Arc<PluginRegistry>,
    pub kernel: Arc<KernelCoordinator>,
    /// 全局事件总线，推送给 WebSocket 客户端。
    pub events_tx: broadcast::Sender<crate::AppEvent>,
    /// Cancelled once on shutdown; long-running work takes child tokens.
    pub shutdown: CancellationToken,
}

static APP_STATE: OnceLock<AppState> = OnceLock::new();

pub fn init_app_state(state: AppState) -> Result<(), AppState> {
    APP_STATE.set(state)
}

pub fn app_state() -> &'static AppState {
    APP_STATE
        .get()
        .expect("app state is initialized before the server starts")
}

/// `COREPILOT_DATA`, else `$HOME/.local/share/corepilot`.
pub fn data_root() -> PathBuf {
    if let Some(root) = std::env::var_os("COREPILOT_DATA").filter(|v| !v.is_empty()) {
        return PathBuf::from(root);
    }

    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local").join("share").join("corepilot"),
        None => PathBuf::from(".corepilot"),
    }
}

pub fn server_addr_from_env() -> SocketAddr {
    let host = std::env::var("COREPILOT_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
    let port = std::env::var("COREPILOT_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);

    format!("{host}:{port}")
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))
}

pub fn init_data_dirs(root: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(root)?;
    for sub in DATA_DIRS {
        std::fs::create_dir_all(root.join(sub))?;
    }
    Ok(())
}

/// Resolves a stored path: relative ones hang off the data root.
pub fn data_path(root: &Path, rel: &str) -> PathBuf {
    let path = Path::new(rel);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// RFC 3339 timestamp used in events and task records.
pub fn current_timestamp() -> String {
    chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_paths_are_rooted() {
        let root = Path::new("/data");
        assert_eq!(data_path(root, "rulesets/a.yaml"), PathBuf::from("/data/rulesets/a.yaml"));
        assert_eq!(data_path(root, "/etc/x.yaml"), PathBuf::from("/etc/x.yaml"));
    }

    #[test]
    fn data_dirs_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        init_data_dirs(&root).unwrap();
        for sub in DATA_DIRS {
            assert!(root.join(sub).is_dir(), "{sub} missing");
        }
    }
}
