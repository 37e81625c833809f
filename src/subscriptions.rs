use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use axum::{extract::Path as UrlPath, Json};
use base64::Engine as _;
use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::app::{app_state, data_path, now_millis};
use crate::ids::new_id;
use crate::plugins::{is_noop_script, Capabilities, PluginError, PluginRegistry, ScriptCall};
use crate::store::{Identified, ListStore, StoreError};
use crate::{ApiResponse, ConfigChangeReason};

/// Fetches in flight during a bulk update.
pub const UPDATE_CONCURRENCY: usize = 5;

pub const DEFAULT_SUBSCRIBE_SCRIPT: &str =
    "const onSubscribe = async (proxies, subscription) => {\n  return { proxies, subscription }\n}";

const USERINFO_HEADER: &str = "subscription-userinfo";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SubscriptionKind {
    #[default]
    Http,
    File,
    Manual,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProxyRef {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub protocol: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Headers {
    #[serde(default)]
    pub request: BTreeMap<String, String>,
    #[serde(default)]
    pub response: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HealthCheck {
    pub enable: bool,
    pub url: String,
    pub interval: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            enable: false,
            url: crate::profiles::DEFAULT_TEST_URL.to_string(),
            interval: 300,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: SubscriptionKind,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub website: String,
    /// Local cache, relative to the data root.
    pub path: String,
    #[serde(default)]
    pub include: String,
    #[serde(default)]
    pub exclude: String,
    #[serde(default)]
    pub include_protocol: String,
    #[serde(default)]
    pub exclude_protocol: String,
    #[serde(default)]
    pub proxy_prefix: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(rename = "inSecure", default)]
    pub insecure: bool,
    #[serde(default = "default_method")]
    pub request_method: String,
    /// Seconds; 0 keeps the shared client's timeout.
    #[serde(default)]
    pub request_timeout: u64,
    #[serde(default)]
    pub header: Headers,
    #[serde(default)]
    pub health_check: HealthCheck,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub use_internal: bool,
    #[serde(default)]
    pub upload: u64,
    #[serde(default)]
    pub download: u64,
    #[serde(default)]
    pub total: u64,
    /// Milliseconds since the epoch, 0 when unknown.
    #[serde(default)]
    pub expire: u64,
    #[serde(default)]
    pub update_time: u64,
    #[serde(default)]
    pub proxies: Vec<ProxyRef>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Identified for Subscription {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Subscription {
    /// Takes over what a resolve of `base` produced. When the stored copy
    /// changed since `base` was taken, only the fetched proxies and usage are
    /// copied, so edits saved during the fetch survive.
    pub fn absorb_resolved(&mut self, base: &Subscription, resolved: Subscription) {
        if self == base {
            *self = resolved;
            return;
        }
        self.proxies = resolved.proxies;
        self.upload = resolved.upload;
        self.download = resolved.download;
        self.total = resolved.total;
        self.expire = resolved.expire;
        self.update_time = resolved.update_time;
    }
}

impl Subscription {
    pub fn new(name: &str, kind: SubscriptionKind, url: &str) -> Self {
        let id = new_id();
        Self {
            path: format!("subscriptions/{id}.yaml"),
            id,
            name: name.to_string(),
            kind,
            url: url.to_string(),
            website: String::new(),
            include: String::new(),
            exclude: String::new(),
            include_protocol: String::new(),
            exclude_protocol: String::new(),
            proxy_prefix: String::new(),
            disabled: false,
            insecure: false,
            request_method: default_method(),
            request_timeout: 15,
            header: Headers::default(),
            health_check: HealthCheck::default(),
            script: DEFAULT_SUBSCRIBE_SCRIPT.to_string(),
            use_internal: false,
            upload: 0,
            download: 0,
            total: 0,
            expire: 0,
            update_time: 0,
            proxies: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("subscription {0} not found")]
    NotFound(String),
    #[error("subscription [{0}] is disabled")]
    Disabled(String),
    #[error("{0}")]
    Fetch(String),
    #[error("not a valid subscription data")]
    InvalidData,
    #[error("a subscription conversion plugin is required to read this subscription")]
    ConversionPluginRequired,
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error("subscription script error: {0}")]
    Script(String),
    #[error("{0}")]
    Persist(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Traffic accounting announced by the provider.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub upload: u64,
    pub download: u64,
    pub total: u64,
    /// Seconds since the epoch as sent by the provider.
    pub expire: u64,
}

/// Parses `upload=1; download=2; total=3; expire=4`. Unknown keys are ignored,
/// unparsable or missing values count as 0, and `1.2e10` style numbers are
/// accepted.
pub fn parse_userinfo(raw: &str) -> Usage {
    let mut usage = Usage::default();
    for part in raw.split(';') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v as u64)
            .unwrap_or(0);
        match key.trim() {
            "upload" => usage.upload = value,
            "download" => usage.download = value,
            "total" => usage.total = value,
            "expire" => usage.expire = value,
            _ => {}
        }
    }
    usage
}

/// Result of parsing a fetched body.
#[derive(Debug, PartialEq)]
pub struct ParsedBody {
    pub proxies: Vec<JsonValue>,
    /// The document also carries `rules`; it could seed a whole profile.
    pub has_rules: bool,
}

pub fn parse_body(body: &str) -> Result<ParsedBody, SubscriptionError> {
    if let Ok(JsonValue::Object(doc)) = serde_yaml::from_str::<JsonValue>(body) {
        if let Some(JsonValue::Array(proxies)) = doc.get("proxies") {
            return Ok(ParsedBody {
                proxies: proxies.clone(),
                has_rules: doc.contains_key("rules"),
            });
        }
    }

    if is_valid_base64(body) {
        return Ok(ParsedBody {
            proxies: vec![serde_json::json!({ "base64": body })],
            has_rules: false,
        });
    }

    Err(SubscriptionError::InvalidData)
}

fn is_valid_base64(body: &str) -> bool {
    use base64::engine::general_purpose::STANDARD;

    if body.trim().is_empty() {
        return false;
    }
    STANDARD
        .decode(body)
        .map(|bytes| STANDARD.encode(bytes) == body)
        .unwrap_or(false)
}

/// Compiles a user pattern; anything that is not a valid regex is matched literally.
pub fn smart_regex(pattern: &str) -> Option<Regex> {
    if pattern.is_empty() {
        return None;
    }
    Regex::new(pattern)
        .or_else(|_| Regex::new(&regex::escape(pattern)))
        .ok()
}

fn proxy_field<'a>(proxy: &'a JsonValue, key: &str) -> &'a str {
    proxy.get(key).and_then(JsonValue::as_str).unwrap_or_default()
}

/// Name and protocol filters, then the name prefix. Exclusions win over inclusions.
pub fn filter_and_prefix(sub: &Subscription, proxies: Vec<JsonValue>) -> Vec<JsonValue> {
    let include = smart_regex(&sub.include);
    let exclude = smart_regex(&sub.exclude);
    let include_protocol = smart_regex(&sub.include_protocol);
    let exclude_protocol = smart_regex(&sub.exclude_protocol);

    let matches = |re: &Option<Regex>, value: &str, default: bool| {
        re.as_ref().map(|r| r.is_match(value)).unwrap_or(default)
    };

    proxies
        .into_iter()
        .filter(|proxy| {
            let name = proxy_field(proxy, "name");
            let protocol = proxy_field(proxy, "type");
            matches(&include, name, true)
                && !matches(&exclude, name, false)
                && matches(&include_protocol, protocol, true)
                && !matches(&exclude_protocol, protocol, false)
        })
        .map(|mut proxy| {
            if !sub.proxy_prefix.is_empty() {
                let name = proxy_field(&proxy, "name");
                if !name.starts_with(&sub.proxy_prefix) {
                    let prefixed = format!("{}{}", sub.proxy_prefix, name);
                    proxy["name"] = JsonValue::String(prefixed);
                }
            }
            proxy
        })
        .collect()
}

/// Assigns each proxy the ID it had under the same name last time, or a new one.
pub fn reconcile(previous: &[ProxyRef], proxies: &[JsonValue]) -> Vec<ProxyRef> {
    proxies
        .iter()
        .map(|proxy| {
            let name = proxy_field(proxy, "name");
            let id = previous
                .iter()
                .find(|p| p.name == name)
                .map(|p| p.id.clone())
                .unwrap_or_else(new_id);
            ProxyRef {
                id,
                name: name.to_string(),
                protocol: proxy_field(proxy, "type").to_string(),
            }
        })
        .collect()
}

/// Like [`reconcile`], but proxies handed back by a script keep the `__id__`
/// they were tagged with.
fn carry_script_ids(previous: &[ProxyRef], proxies: &[JsonValue]) -> Vec<ProxyRef> {
    let mut refs = reconcile(previous, proxies);
    for (r, proxy) in refs.iter_mut().zip(proxies) {
        if let Some(id) = proxy.get("__id__").and_then(JsonValue::as_str) {
            r.id = id.to_string();
        }
    }
    refs
}

/// Everything the resolver reads besides the subscription itself.
pub struct ResolveContext<'a> {
    pub http: &'a reqwest::Client,
    pub data_root: &'a Path,
    pub plugins: &'a PluginRegistry,
}

struct Fetched {
    body: String,
    headers: BTreeMap<String, String>,
}

async fn fetch(sub: &Subscription, ctx: &ResolveContext<'_>) -> Result<Fetched, SubscriptionError> {
    match sub.kind {
        SubscriptionKind::Manual => {
            let path = data_path(ctx.data_root, &sub.path);
            let body = match std::fs::read_to_string(&path) {
                Ok(body) => body,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    let empty = "proxies: []\n";
                    crate::store::write_atomic(&path, empty.as_bytes())
                        .map_err(SubscriptionError::Persist)?;
                    empty.to_string()
                }
                Err(err) => {
                    return Err(SubscriptionError::Fetch(format!(
                        "failed to read {}: {err}",
                        path.display()
                    )))
                }
            };
            Ok(Fetched {
                body,
                headers: BTreeMap::new(),
            })
        }
        SubscriptionKind::File => {
            let path = data_path(ctx.data_root, &sub.url);
            let body = std::fs::read_to_string(&path).map_err(|err| {
                SubscriptionError::Fetch(format!("failed to read {}: {err}", path.display()))
            })?;
            Ok(Fetched {
                body,
                headers: BTreeMap::new(),
            })
        }
        SubscriptionKind::Http => fetch_http(sub, ctx.http).await,
    }
}

async fn fetch_http(sub: &Subscription, shared: &reqwest::Client) -> Result<Fetched, SubscriptionError> {
    let insecure_client;
    let client = if sub.insecure {
        insecure_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|err| SubscriptionError::Fetch(format!("failed to build http client: {err}")))?;
        &insecure_client
    } else {
        shared
    };

    let method = reqwest::Method::from_bytes(sub.request_method.to_uppercase().as_bytes())
        .map_err(|_| SubscriptionError::Fetch(format!("invalid request method {}", sub.request_method)))?;

    let mut req = client.request(method, &sub.url);
    for (key, value) in &sub.header.request {
        req = req.header(key.as_str(), value.as_str());
    }
    if sub.request_timeout > 0 {
        req = req.timeout(Duration::from_secs(sub.request_timeout));
    }

    let resp = req
        .send()
        .await
        .map_err(|err| SubscriptionError::Fetch(format!("failed to send request: {err}")))?
        .error_for_status()
        .map_err(|err| SubscriptionError::Fetch(format!("request failed: {err}")))?;

    let headers = resp
        .headers()
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_ascii_lowercase(), v.to_str().ok()?.to_string())))
        .collect();

    let body = resp
        .text()
        .await
        .map_err(|err| SubscriptionError::Fetch(format!("failed to read response body: {err}")))?;

    Ok(Fetched { body, headers })
}

#[derive(Deserialize)]
struct ScriptOutput {
    proxies: Vec<JsonValue>,
    subscription: Subscription,
}

/// Runs one subscription through fetch, parse, hooks, filters, reconciliation,
/// the user script and accounting. Returns the updated entity; the caller
/// decides when to persist the store.
pub async fn resolve(
    mut sub: Subscription,
    ctx: &ResolveContext<'_>,
) -> Result<Subscription, SubscriptionError> {
    let Fetched { body, mut headers } = fetch(&sub, ctx).await?;
    let ParsedBody { proxies, has_rules } = parse_body(&body)?;
    if has_rules && sub.use_internal {
        tracing::debug!("subscription {} ships its own rules", sub.name);
    }

    let sub_json = serde_json::to_value(&sub)
        .map_err(|err| SubscriptionError::Persist(format!("failed to serialize subscription: {err}")))?;
    let mut proxies = ctx.plugins.on_subscribe(proxies, &sub_json).await?;
    if proxies.iter().any(|p| p.get("base64").is_some()) {
        return Err(SubscriptionError::ConversionPluginRequired);
    }

    if sub.kind != SubscriptionKind::Manual {
        proxies = filter_and_prefix(&sub, proxies);
    }

    sub.proxies = reconcile(&sub.proxies, &proxies);

    if !is_noop_script(&sub.script, DEFAULT_SUBSCRIBE_SCRIPT) {
        let (script_proxies, updated) = run_script(&sub, proxies, ctx).await?;
        sub = updated;
        sub.proxies = carry_script_ids(&sub.proxies, &script_proxies);
        proxies = script_proxies;
    }

    for (key, value) in &sub.header.response {
        headers.insert(key.to_ascii_lowercase(), value.clone());
    }
    let usage = headers
        .get(USERINFO_HEADER)
        .map(|raw| parse_userinfo(raw))
        .unwrap_or_default();
    sub.upload = usage.upload;
    sub.download = usage.download;
    sub.total = usage.total;
    sub.expire = usage.expire.saturating_mul(1000);
    sub.update_time = now_millis();

    let persists = match sub.kind {
        SubscriptionKind::Http => true,
        SubscriptionKind::File => sub.url != sub.path,
        SubscriptionKind::Manual => false,
    };
    if persists {
        write_cache(ctx.data_root, &sub.path, &proxies)?;
    }

    Ok(sub)
}

async fn run_script(
    sub: &Subscription,
    proxies: Vec<JsonValue>,
    ctx: &ResolveContext<'_>,
) -> Result<(Vec<JsonValue>, Subscription), SubscriptionError> {
    // 脚本看到的 proxies 带有稳定 ID，便于按 ID 做修改。
    let tagged: Vec<JsonValue> = proxies
        .into_iter()
        .zip(&sub.proxies)
        .map(|(mut proxy, r)| {
            proxy["__id__"] = JsonValue::String(r.id.clone());
            proxy
        })
        .collect();
    let sub_json = serde_json::to_value(sub)
        .map_err(|err| SubscriptionError::Script(err.to_string()))?;

    let call = ScriptCall {
        label: format!("subscription [{}]", sub.name),
        source: sub.script.clone(),
        entry: "onSubscribe".to_string(),
        args: vec![JsonValue::Array(tagged), sub_json],
        settings: JsonValue::Null,
        capabilities: Capabilities::none(),
    };
    let result = ctx
        .plugins
        .runtime()
        .invoke(call)
        .await
        .map_err(SubscriptionError::Script)?;
    let ScriptOutput { proxies, mut subscription } = serde_json::from_value(result)
        .map_err(|err| SubscriptionError::Script(format!("wrong result: {err}")))?;

    // The script may not rename or move the entity.
    subscription.id = sub.id.clone();
    subscription.path = sub.path.clone();
    subscription.proxies = sub.proxies.clone();
    Ok((proxies, subscription))
}

/// Writes `{proxies: [...]}` without the bookkeeping keys.
fn write_cache(root: &Path, rel: &str, proxies: &[JsonValue]) -> Result<(), SubscriptionError> {
    let cleaned: Vec<JsonValue> = proxies
        .iter()
        .cloned()
        .map(|mut proxy| {
            if let Some(obj) = proxy.as_object_mut() {
                obj.remove("__id__");
                obj.remove("__tmp__id__");
            }
            proxy
        })
        .collect();
    let content = serde_yaml::to_string(&serde_json::json!({ "proxies": cleaned }))
        .map_err(|err| SubscriptionError::Persist(format!("failed to serialize proxies: {err}")))?;
    crate::store::write_atomic(&data_path(root, rel), content.as_bytes())
        .map_err(SubscriptionError::Persist)
}

/// Reads the full proxy records cached for a subscription.
pub fn read_cached_proxies(root: &Path, sub: &Subscription) -> Result<Vec<JsonValue>, String> {
    let path = data_path(root, &sub.path);
    let content = std::fs::read_to_string(&path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    let doc: JsonValue = serde_yaml::from_str(&content)
        .map_err(|err| format!("failed to parse {}: {err}", path.display()))?;
    match doc.get("proxies") {
        Some(JsonValue::Array(list)) => Ok(list.clone()),
        _ => Ok(Vec::new()),
    }
}

/// Per-item result of a bulk update.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct UpdateOutcome {
    pub id: String,
    pub name: String,
    pub ok: bool,
    pub message: String,
}

/// Updates one subscription and persists the store.
pub async fn update_one(
    store: &ListStore<Subscription>,
    id: &str,
    ctx: &ResolveContext<'_>,
) -> Result<Subscription, SubscriptionError> {
    let sub = store
        .get(id)
        .ok_or_else(|| SubscriptionError::NotFound(id.to_string()))?;
    if sub.disabled {
        return Err(SubscriptionError::Disabled(sub.name));
    }

    let base = sub.clone();
    let updated = resolve(sub, ctx).await.map_err(|err| {
        tracing::warn!("failed to update subscription [{}]: {err}", base.name);
        err
    })?;
    let stored = store
        .modify(id, |current| current.absorb_resolved(&base, updated))
        .await?;
    tracing::info!("subscription [{}] updated, {} proxies", stored.name, stored.proxies.len());
    Ok(stored)
}

/// Updates every enabled subscription, at most [`UPDATE_CONCURRENCY`] at a
/// time. Failures are isolated; successes are saved once at the end.
pub async fn update_all(
    store: &ListStore<Subscription>,
    ctx: &ResolveContext<'_>,
) -> Vec<UpdateOutcome> {
    let pending: Vec<Subscription> = store.snapshot().into_iter().filter(|s| !s.disabled).collect();

    let results: Vec<(UpdateOutcome, Option<(Subscription, Subscription)>)> = stream::iter(pending)
        .map(|sub| async move {
            let base = sub.clone();
            let (id, name) = (sub.id.clone(), sub.name.clone());
            match resolve(sub, ctx).await {
                Ok(updated) => (
                    UpdateOutcome {
                        id,
                        message: format!("Subscription [{name}] updated successfully."),
                        name,
                        ok: true,
                    },
                    Some((base, updated)),
                ),
                Err(err) => (
                    UpdateOutcome {
                        id,
                        message: format!("Failed to update subscription [{name}]. Reason: {err}"),
                        name,
                        ok: false,
                    },
                    None,
                ),
            }
        })
        .buffer_unordered(UPDATE_CONCURRENCY)
        .collect()
        .await;

    let mut changed = false;
    let mut outcomes = Vec::with_capacity(results.len());
    for (outcome, updated) in results {
        if let Some((base, updated)) = updated {
            changed |= store
                .update_in_place(&base.id, |slot| slot.absorb_resolved(&base, updated))
                .is_some();
        } else {
            tracing::warn!("{}", outcome.message);
        }
        outcomes.push(outcome);
    }

    if changed {
        if let Err(err) = store.save().await {
            tracing::error!("failed to save subscriptions after bulk update: {err}");
            for outcome in outcomes.iter_mut().filter(|o| o.ok) {
                outcome.ok = false;
                outcome.message = format!("Failed to save subscription [{}]: {err}", outcome.name);
            }
        }
    }

    outcomes
}

// ---------------------------------------------------------------------------
// HTTP handlers

#[derive(Deserialize)]
pub struct CreateSubscriptionRequest {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: SubscriptionKind,
    #[serde(default)]
    pub url: String,
}

fn subscription_error_code(err: &SubscriptionError) -> &'static str {
    match err {
        SubscriptionError::NotFound(_) | SubscriptionError::Store(StoreError::NotFound(_)) => {
            "subscription_not_found"
        }
        SubscriptionError::Disabled(_) => "subscription_disabled",
        SubscriptionError::Fetch(_) => "subscription_fetch_failed",
        SubscriptionError::InvalidData | SubscriptionError::ConversionPluginRequired => {
            "subscription_invalid"
        }
        SubscriptionError::Plugin(_) => "plugin_failed",
        SubscriptionError::Script(_) => "subscription_script_failed",
        SubscriptionError::Persist(_) | SubscriptionError::Store(_) => "subscription_save_failed",
    }
}

fn resolve_context() -> ResolveContext<'static> {
    let state = app_state();
    ResolveContext {
        http: &state.http_client,
        data_root: &state.data_root,
        plugins: &state.plugins,
    }
}

pub async fn list_subscriptions() -> Json<ApiResponse<Vec<Subscription>>> {
    Json(ApiResponse::ok(app_state().subscriptions.snapshot()))
}

pub async fn get_subscription(UrlPath(id): UrlPath<String>) -> Json<ApiResponse<Subscription>> {
    match app_state().subscriptions.get(&id) {
        Some(sub) => Json(ApiResponse::ok(sub)),
        None => Json(ApiResponse::error("subscription_not_found", "subscription not found")),
    }
}

pub async fn create_subscription(
    Json(body): Json<CreateSubscriptionRequest>,
) -> Json<ApiResponse<Subscription>> {
    let state = app_state();
    let sub = Subscription::new(body.name.trim(), body.kind, body.url.trim());

    if let Err(err) = state.subscriptions.add(sub.clone()).await {
        tracing::error!("failed to create subscription {}: {err}", sub.name);
        return Json(ApiResponse::error("subscription_save_failed", err.to_string()));
    }

    Json(ApiResponse::ok(sub))
}

pub async fn update_subscription(
    UrlPath(id): UrlPath<String>,
    Json(mut body): Json<Subscription>,
) -> Json<ApiResponse<Subscription>> {
    let state = app_state();
    body.id = id.clone();

    if let Err(err) = state.subscriptions.edit(&id, body.clone()).await {
        tracing::error!("failed to update subscription {id}: {err}");
        let err = SubscriptionError::from(err);
        return Json(ApiResponse::error(subscription_error_code(&err), err.to_string()));
    }

    crate::kernel::notify_config_change(ConfigChangeReason::SubscriptionChanged { id });
    Json(ApiResponse::ok(body))
}

pub async fn delete_subscription(UrlPath(id): UrlPath<String>) -> Json<ApiResponse<JsonValue>> {
    let state = app_state();

    match state.subscriptions.delete(&id).await {
        Ok(sub) => {
            if sub.kind != SubscriptionKind::File || sub.url != sub.path {
                let path = data_path(&state.data_root, &sub.path);
                if let Err(err) = std::fs::remove_file(&path) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("failed to remove subscription cache {}: {err}", path.display());
                    }
                }
            }
            crate::kernel::notify_config_change(ConfigChangeReason::SubscriptionChanged { id });
            Json(ApiResponse::ok(serde_json::json!({})))
        }
        Err(err) => {
            let err = SubscriptionError::from(err);
            Json(ApiResponse::error(subscription_error_code(&err), err.to_string()))
        }
    }
}

pub async fn refresh_subscription(UrlPath(id): UrlPath<String>) -> Json<ApiResponse<Subscription>> {
    let state = app_state();
    let ctx = resolve_context();

    match update_one(&state.subscriptions, &id, &ctx).await {
        Ok(sub) => {
            crate::kernel::notify_config_change(ConfigChangeReason::SubscriptionChanged { id });
            Json(ApiResponse::ok(sub))
        }
        Err(err) => Json(ApiResponse::error(subscription_error_code(&err), err.to_string())),
    }
}

pub async fn refresh_all_subscriptions() -> Json<ApiResponse<Vec<UpdateOutcome>>> {
    let state = app_state();
    let ctx = resolve_context();

    let outcomes = update_all(&state.subscriptions, &ctx).await;
    let updated: Vec<String> = outcomes.iter().filter(|o| o.ok).map(|o| o.id.clone()).collect();
    if !updated.is_empty() {
        crate::kernel::notify_config_change(ConfigChangeReason::SubscriptionsUpdated { ids: updated });
    }
    Json(ApiResponse::ok(outcomes))
}

/// 定时任务入口：批量更新所有启用的订阅。
pub async fn auto_update_subscriptions() -> Result<(), String> {
    let Json(resp) = refresh_all_subscriptions().await;
    outcomes_result(resp.data.unwrap_or_default())
}

/// Folds bulk outcomes into one task result. Nothing to update is a success.
pub fn outcomes_result(outcomes: Vec<UpdateOutcome>) -> Result<(), String> {
    let failed: Vec<String> = outcomes.into_iter().filter(|o| !o.ok).map(|o| o.message).collect();
    if failed.is_empty() {
        Ok(())
    } else {
        Err(failed.join("; "))
    }
}
