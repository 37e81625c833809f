use std::collections::HashSet;
use std::path::Path;

use axum::{extract::Path as UrlPath, Json};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::app::{app_state, data_path, now_millis};
use crate::ids::new_id;
use crate::profiles::{RulesetBehavior, RulesetFormat};
use crate::store::{write_atomic, Identified, ListStore, StoreError};
use crate::subscriptions::{outcomes_result, UpdateOutcome, UPDATE_CONCURRENCY};
use crate::{ApiResponse, ConfigChangeReason};

const EMPTY_RULESET: &str = "payload: []\n";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RulesetKind {
    #[default]
    Http,
    File,
    Manual,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ruleset {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: RulesetKind,
    #[serde(default)]
    pub behavior: RulesetBehavior,
    #[serde(default)]
    pub format: RulesetFormat,
    /// Local cache, relative to the data root.
    pub path: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub update_time: u64,
    #[serde(default)]
    pub disabled: bool,
}

impl Identified for Ruleset {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Ruleset {
    /// Copies the fields a resolve owns, leaving everything the user edits.
    pub fn absorb_resolved(&mut self, resolved: &Ruleset) {
        self.count = resolved.count;
        self.update_time = resolved.update_time;
    }

    pub fn new(name: &str, kind: RulesetKind, format: RulesetFormat, url: &str) -> Self {
        let id = new_id();
        Self {
            path: format!("rulesets/{id}.{}", format.as_str()),
            id,
            name: name.to_string(),
            kind,
            behavior: RulesetBehavior::Domain,
            format,
            url: url.to_string(),
            count: 0,
            update_time: 0,
            disabled: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RulesetError {
    #[error("ruleset {0} not found")]
    NotFound(String),
    #[error("ruleset [{0}] is disabled")]
    Disabled(String),
    #[error("{0}")]
    Fetch(String),
    #[error("not a valid ruleset data: {0}")]
    InvalidPayload(String),
    #[error("download cancelled")]
    Cancelled,
    #[error("{0}")]
    Persist(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Checks that `body` is a mapping whose only key is `payload` holding a list,
/// and returns the entries with duplicates removed, first occurrence kept.
pub fn normalize_payload(body: &str) -> Result<Vec<serde_yaml::Value>, RulesetError> {
    let doc: serde_yaml::Value =
        serde_yaml::from_str(body).map_err(|err| RulesetError::InvalidPayload(err.to_string()))?;
    let serde_yaml::Value::Mapping(map) = doc else {
        return Err(RulesetError::InvalidPayload("expected a mapping".to_string()));
    };
    if map.len() != 1 {
        return Err(RulesetError::InvalidPayload(
            "expected a single `payload` key".to_string(),
        ));
    }
    let Some(serde_yaml::Value::Sequence(entries)) = map.get("payload") else {
        return Err(RulesetError::InvalidPayload(
            "`payload` must be a list".to_string(),
        ));
    };

    let mut seen: HashSet<&serde_yaml::Value> = HashSet::with_capacity(entries.len());
    let unique = entries
        .iter()
        .filter(|entry| seen.insert(*entry))
        .cloned()
        .collect();
    Ok(unique)
}

async fn fetch_text(http: &reqwest::Client, url: &str) -> Result<String, RulesetError> {
    let resp = http
        .get(url)
        .send()
        .await
        .map_err(|err| RulesetError::Fetch(format!("failed to send request: {err}")))?
        .error_for_status()
        .map_err(|err| RulesetError::Fetch(format!("request failed: {err}")))?;
    resp.text()
        .await
        .map_err(|err| RulesetError::Fetch(format!("failed to read response body: {err}")))
}

/// Streams `url` into `dest`. Cancelling `token` aborts the transfer and
/// removes whatever was written so far.
pub async fn download(
    http: &reqwest::Client,
    url: &str,
    dest: &Path,
    token: &CancellationToken,
) -> Result<u64, RulesetError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|err| {
            RulesetError::Persist(format!("failed to create {}: {err}", parent.display()))
        })?;
    }

    let mut tmp_name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".part");
    let tmp = dest.with_file_name(tmp_name);

    let result = download_to(http, url, &tmp, token).await;
    match result {
        Ok(written) => {
            tokio::fs::rename(&tmp, dest).await.map_err(|err| {
                RulesetError::Persist(format!("failed to move {} into place: {err}", tmp.display()))
            })?;
            Ok(written)
        }
        Err(err) => {
            if let Err(rm_err) = tokio::fs::remove_file(&tmp).await {
                if rm_err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("failed to remove partial download {}: {rm_err}", tmp.display());
                }
            }
            Err(err)
        }
    }
}

async fn download_to(
    http: &reqwest::Client,
    url: &str,
    tmp: &Path,
    token: &CancellationToken,
) -> Result<u64, RulesetError> {
    let mut resp = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(RulesetError::Cancelled),
        resp = http.get(url).send() => resp
            .map_err(|err| RulesetError::Fetch(format!("failed to send request: {err}")))?
            .error_for_status()
            .map_err(|err| RulesetError::Fetch(format!("request failed: {err}")))?,
    };

    let mut file = tokio::fs::File::create(tmp)
        .await
        .map_err(|err| RulesetError::Persist(format!("failed to create {}: {err}", tmp.display())))?;

    let mut written: u64 = 0;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(RulesetError::Cancelled),
            chunk = resp.chunk() => chunk
                .map_err(|err| RulesetError::Fetch(format!("failed to read response body: {err}")))?,
        };
        let Some(chunk) = chunk else { break };
        file.write_all(&chunk)
            .await
            .map_err(|err| RulesetError::Persist(format!("failed to write {}: {err}", tmp.display())))?;
        written = written.saturating_add(chunk.len() as u64);
    }

    file.flush()
        .await
        .map_err(|err| RulesetError::Persist(format!("failed to flush {}: {err}", tmp.display())))?;
    Ok(written)
}

/// Everything the resolver reads besides the ruleset itself.
pub struct ResolveContext<'a> {
    pub http: &'a reqwest::Client,
    pub data_root: &'a Path,
    pub cancel: CancellationToken,
}

/// Refreshes one ruleset's local cache and returns the updated entity.
pub async fn resolve(mut ruleset: Ruleset, ctx: &ResolveContext<'_>) -> Result<Ruleset, RulesetError> {
    let dest = data_path(ctx.data_root, &ruleset.path);

    match ruleset.format {
        RulesetFormat::Yaml => {
            let (body, existed) = match ruleset.kind {
                RulesetKind::File => (read_text(&data_path(ctx.data_root, &ruleset.url))?, true),
                RulesetKind::Http => (fetch_text(ctx.http, &ruleset.url).await?, true),
                RulesetKind::Manual => match std::fs::read_to_string(&dest) {
                    Ok(body) if !body.trim().is_empty() => (body, true),
                    Ok(_) => (EMPTY_RULESET.to_string(), false),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        (EMPTY_RULESET.to_string(), false)
                    }
                    Err(err) => {
                        return Err(RulesetError::Fetch(format!(
                            "failed to read {}: {err}",
                            dest.display()
                        )))
                    }
                },
            };

            let payload = normalize_payload(&body)?;
            let persists = match ruleset.kind {
                RulesetKind::Http => true,
                RulesetKind::File => ruleset.url != ruleset.path,
                RulesetKind::Manual => !existed,
            };
            if persists {
                let mut doc = serde_yaml::Mapping::new();
                doc.insert("payload".into(), serde_yaml::Value::Sequence(payload.clone()));
                let content = serde_yaml::to_string(&doc)
                    .map_err(|err| RulesetError::Persist(format!("failed to serialize ruleset: {err}")))?;
                write_atomic(&dest, content.as_bytes()).map_err(RulesetError::Persist)?;
            }
            ruleset.count = payload.len();
        }
        RulesetFormat::Mrs => match ruleset.kind {
            RulesetKind::File if ruleset.url != ruleset.path => {
                let src = data_path(ctx.data_root, &ruleset.url);
                copy_into_place(&src, &dest)?;
            }
            RulesetKind::Http => {
                download(ctx.http, &ruleset.url, &dest, &ctx.cancel).await?;
            }
            _ => {}
        },
    }

    ruleset.update_time = now_millis();
    Ok(ruleset)
}

fn read_text(path: &Path) -> Result<String, RulesetError> {
    std::fs::read_to_string(path)
        .map_err(|err| RulesetError::Fetch(format!("failed to read {}: {err}", path.display())))
}

fn copy_into_place(src: &Path, dest: &Path) -> Result<(), RulesetError> {
    let bytes = std::fs::read(src)
        .map_err(|err| RulesetError::Fetch(format!("failed to read {}: {err}", src.display())))?;
    write_atomic(dest, &bytes).map_err(RulesetError::Persist)
}

pub async fn update_one(
    store: &ListStore<Ruleset>,
    id: &str,
    ctx: &ResolveContext<'_>,
) -> Result<Ruleset, RulesetError> {
    let ruleset = store
        .get(id)
        .ok_or_else(|| RulesetError::NotFound(id.to_string()))?;
    if ruleset.disabled {
        return Err(RulesetError::Disabled(ruleset.name));
    }

    let updated = resolve(ruleset, ctx).await?;
    let stored = store
        .modify(id, |current| current.absorb_resolved(&updated))
        .await?;
    tracing::info!("ruleset [{}] updated, {} entries", stored.name, stored.count);
    Ok(stored)
}

/// Bounded, failure-isolated refresh of every enabled ruleset.
pub async fn update_all(store: &ListStore<Ruleset>, ctx: &ResolveContext<'_>) -> Vec<UpdateOutcome> {
    let pending: Vec<Ruleset> = store.snapshot().into_iter().filter(|r| !r.disabled).collect();

    let results: Vec<(UpdateOutcome, Option<Ruleset>)> = stream::iter(pending)
        .map(|ruleset| async move {
            let (id, name) = (ruleset.id.clone(), ruleset.name.clone());
            match resolve(ruleset, ctx).await {
                Ok(updated) => (
                    UpdateOutcome {
                        id,
                        message: format!("Ruleset [{name}] updated successfully."),
                        name,
                        ok: true,
                    },
                    Some(updated),
                ),
                Err(err) => (
                    UpdateOutcome {
                        id,
                        message: format!("Failed to update ruleset [{name}]. Reason: {err}"),
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
        match updated {
            Some(updated) => {
                let id = updated.id.clone();
                changed |= store
                    .update_in_place(&id, |slot| slot.absorb_resolved(&updated))
                    .is_some();
            }
            None => tracing::warn!("{}", outcome.message),
        }
        outcomes.push(outcome);
    }

    if changed {
        if let Err(err) = store.save().await {
            tracing::error!("failed to save rulesets after bulk update: {err}");
            for outcome in outcomes.iter_mut().filter(|o| o.ok) {
                outcome.ok = false;
                outcome.message = format!("Failed to save ruleset [{}]: {err}", outcome.name);
            }
        }
    }

    outcomes
}

// ---------------------------------------------------------------------------
// HTTP handlers

#[derive(Deserialize)]
pub struct CreateRulesetRequest {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: RulesetKind,
    #[serde(default)]
    pub behavior: RulesetBehavior,
    #[serde(default)]
    pub format: RulesetFormat,
    #[serde(default)]
    pub url: String,
}

fn ruleset_error_code(err: &RulesetError) -> &'static str {
    match err {
        RulesetError::NotFound(_) | RulesetError::Store(StoreError::NotFound(_)) => "ruleset_not_found",
        RulesetError::Disabled(_) => "ruleset_disabled",
        RulesetError::Fetch(_) | RulesetError::Cancelled => "ruleset_fetch_failed",
        RulesetError::InvalidPayload(_) => "ruleset_invalid",
        RulesetError::Persist(_) | RulesetError::Store(_) => "ruleset_save_failed",
    }
}

fn resolve_context() -> ResolveContext<'static> {
    let state = app_state();
    ResolveContext {
        http: &state.http_client,
        data_root: &state.data_root,
        cancel: state.shutdown.child_token(),
    }
}

pub async fn list_rulesets() -> Json<ApiResponse<Vec<Ruleset>>> {
    Json(ApiResponse::ok(app_state().rulesets.snapshot()))
}

pub async fn create_ruleset(Json(body): Json<CreateRulesetRequest>) -> Json<ApiResponse<Ruleset>> {
    let state = app_state();
    let mut ruleset = Ruleset::new(body.name.trim(), body.kind, body.format, body.url.trim());
    ruleset.behavior = body.behavior;

    if let Err(err) = state.rulesets.add(ruleset.clone()).await {
        tracing::error!("failed to create ruleset {}: {err}", ruleset.name);
        return Json(ApiResponse::error("ruleset_save_failed", err.to_string()));
    }

    Json(ApiResponse::ok(ruleset))
}

pub async fn update_ruleset(
    UrlPath(id): UrlPath<String>,
    Json(mut body): Json<Ruleset>,
) -> Json<ApiResponse<Ruleset>> {
    let state = app_state();
    body.id = id.clone();

    if let Err(err) = state.rulesets.edit(&id, body.clone()).await {
        tracing::error!("failed to update ruleset {id}: {err}");
        let err = RulesetError::from(err);
        return Json(ApiResponse::error(ruleset_error_code(&err), err.to_string()));
    }

    crate::kernel::notify_config_change(ConfigChangeReason::RulesetChanged { id });
    Json(ApiResponse::ok(body))
}

pub async fn delete_ruleset(UrlPath(id): UrlPath<String>) -> Json<ApiResponse<JsonValue>> {
    let state = app_state();

    match state.rulesets.delete(&id).await {
        Ok(ruleset) => {
            if ruleset.kind != RulesetKind::File || ruleset.url != ruleset.path {
                let path = data_path(&state.data_root, &ruleset.path);
                if let Err(err) = std::fs::remove_file(&path) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("failed to remove ruleset cache {}: {err}", path.display());
                    }
                }
            }
            crate::kernel::notify_config_change(ConfigChangeReason::RulesetChanged { id });
            Json(ApiResponse::ok(serde_json::json!({})))
        }
        Err(err) => {
            let err = RulesetError::from(err);
            Json(ApiResponse::error(ruleset_error_code(&err), err.to_string()))
        }
    }
}

pub async fn refresh_ruleset(UrlPath(id): UrlPath<String>) -> Json<ApiResponse<Ruleset>> {
    let state = app_state();
    let ctx = resolve_context();

    match update_one(&state.rulesets, &id, &ctx).await {
        Ok(ruleset) => {
            crate::kernel::notify_config_change(ConfigChangeReason::RulesetChanged { id });
            Json(ApiResponse::ok(ruleset))
        }
        Err(err) => {
            tracing::warn!("failed to update ruleset {id}: {err}");
            Json(ApiResponse::error(ruleset_error_code(&err), err.to_string()))
        }
    }
}

pub async fn refresh_all_rulesets() -> Json<ApiResponse<Vec<UpdateOutcome>>> {
    let state = app_state();
    let ctx = resolve_context();

    let outcomes = update_all(&state.rulesets, &ctx).await;
    let updated: Vec<String> = outcomes.iter().filter(|o| o.ok).map(|o| o.id.clone()).collect();
    if !updated.is_empty() {
        crate::kernel::notify_config_change(ConfigChangeReason::RulesetsUpdated { ids: updated });
    }
    Json(ApiResponse::ok(outcomes))
}

/// Scheduled refresh of every enabled ruleset.
pub async fn auto_update_rulesets() -> Result<(), String> {
    let Json(resp) = refresh_all_rulesets().await;
    outcomes_result(resp.data.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ctx<'a>(http: &'a reqwest::Client, root: &'a Path) -> ResolveContext<'a> {
        ResolveContext {
            http,
            data_root: root,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn payload_is_deduplicated_in_order() {
        let entries = normalize_payload("payload:\n  - b.com\n  - a.com\n  - b.com\n").unwrap();
        let entries: Vec<_> = entries.iter().filter_map(|v| v.as_str()).collect();
        assert_eq!(entries, vec!["b.com", "a.com"]);
    }

    #[test]
    fn large_payload_is_deduplicated_quickly() {
        let mut body = String::from("payload:\n");
        for i in 0..100_000 {
            body.push_str(&format!("  - '+.host{i}.example.com'\n"));
        }
        body.push_str("  - '+.host0.example.com'\n");

        let started = std::time::Instant::now();
        let entries = normalize_payload(&body).unwrap();
        assert_eq!(entries.len(), 100_000);
        assert_eq!(entries[0].as_str(), Some("+.host0.example.com"));
        assert!(started.elapsed() < Duration::from_secs(30), "took {:?}", started.elapsed());
    }

    #[test]
    fn payload_document_shape_is_enforced() {
        assert!(matches!(
            normalize_payload("payload: []\nextra: 1\n"),
            Err(RulesetError::InvalidPayload(_))
        ));
        assert!(matches!(
            normalize_payload("payload: example.com\n"),
            Err(RulesetError::InvalidPayload(_))
        ));
        assert!(matches!(
            normalize_payload("- a\n- b\n"),
            Err(RulesetError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn manual_ruleset_is_created_empty() {
        let dir = tempfile::tempdir().unwrap();
        let http = reqwest::Client::new();
        let ruleset = Ruleset::new("mine", RulesetKind::Manual, RulesetFormat::Yaml, "");

        let updated = resolve(ruleset, &ctx(&http, dir.path())).await.unwrap();
        assert_eq!(updated.count, 0);
        let content = std::fs::read_to_string(dir.path().join(&updated.path)).unwrap();
        assert!(normalize_payload(&content).unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_ruleset_is_normalized_into_its_cache() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ads.yaml"), "payload: [x.com, x.com, y.com]\n").unwrap();
        let http = reqwest::Client::new();
        let ruleset = Ruleset::new("ads", RulesetKind::File, RulesetFormat::Yaml, "ads.yaml");

        let updated = resolve(ruleset, &ctx(&http, dir.path())).await.unwrap();
        assert_eq!(updated.count, 2);
        let cached = std::fs::read_to_string(dir.path().join(&updated.path)).unwrap();
        assert_eq!(normalize_payload(&cached).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mrs_file_is_copied_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cn.mrs"), [0u8, 159, 146, 150]).unwrap();
        let http = reqwest::Client::new();
        let ruleset = Ruleset::new("cn", RulesetKind::File, RulesetFormat::Mrs, "cn.mrs");

        let updated = resolve(ruleset, &ctx(&http, dir.path())).await.unwrap();
        assert!(updated.path.ends_with(".mrs"));
        assert_eq!(std::fs::read(dir.path().join(&updated.path)).unwrap(), vec![0u8, 159, 146, 150]);
    }

    #[tokio::test]
    async fn cancelled_download_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let http = reqwest::Client::new();
        let dest = dir.path().join("rulesets").join("x.mrs");
        let token = CancellationToken::new();
        token.cancel();

        let err = download(&http, "http://127.0.0.1:9/never", &dest, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, RulesetError::Cancelled));
        assert!(!dest.exists());
        assert!(!dir.path().join("rulesets").join("x.mrs.part").exists());
    }

    #[tokio::test]
    async fn update_keeps_edits_saved_during_the_fetch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ads.yaml"), "payload: [a.com, b.com]\n").unwrap();
        let store = ListStore::new(dir.path().join("config/rulesets.yaml"), Duration::ZERO);
        let ruleset = Ruleset::new("ads", RulesetKind::File, RulesetFormat::Yaml, "ads.yaml");
        store.add(ruleset.clone()).await.unwrap();

        let http = reqwest::Client::new();
        let resolved = resolve(ruleset.clone(), &ctx(&http, dir.path())).await.unwrap();
        store.update_in_place(&ruleset.id, |r| {
            r.name = "ads-renamed".to_string();
            r.disabled = true;
        });
        store.update_in_place(&ruleset.id, |r| r.absorb_resolved(&resolved));

        let stored = store.get(&ruleset.id).unwrap();
        assert_eq!(stored.name, "ads-renamed");
        assert!(stored.disabled);
        assert_eq!(stored.count, 2);
        assert_eq!(stored.update_time, resolved.update_time);
    }

    #[tokio::test]
    async fn bulk_update_reports_each_ruleset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.yaml"), "payload: [a.com]\n").unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "rules: []\n").unwrap();
        let store = ListStore::new(dir.path().join("config/rulesets.yaml"), Duration::ZERO);
        let good = Ruleset::new("good", RulesetKind::File, RulesetFormat::Yaml, "good.yaml");
        let bad = Ruleset::new("bad", RulesetKind::File, RulesetFormat::Yaml, "bad.yaml");
        store.add(good.clone()).await.unwrap();
        store.add(bad.clone()).await.unwrap();

        let http = reqwest::Client::new();
        let outcomes = update_all(&store, &ctx(&http, dir.path())).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().any(|o| o.id == good.id && o.ok));
        assert!(outcomes.iter().any(|o| o.id == bad.id && !o.ok));
        assert_eq!(store.get(&good.id).unwrap().count, 1);
    }
}
