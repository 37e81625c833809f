use std::collections::HashMap;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::profiles::AdvancedConfig;

/// Where the kernel's RESTful controller listens, and how to authenticate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerEndpoint {
    pub base_url: String,
    pub secret: String,
}

impl ControllerEndpoint {
    /// Wildcard or missing hosts are reached through loopback.
    pub fn from_config(advanced: &AdvancedConfig) -> Self {
        let addr = advanced.external_controller.trim();
        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => (host, port),
            None => ("", addr),
        };
        let host = match host {
            "" | "0.0.0.0" | "[::]" | "::" => "127.0.0.1",
            other => other,
        };
        Self {
            base_url: format!("http://{host}:{port}"),
            secret: advanced.secret.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }
}

/// The kernel's control API, as far as the coordinator needs it.
pub trait ControlApi: Send + Sync {
    fn get<'a>(
        &'a self,
        endpoint: &'a ControllerEndpoint,
        path: &'a str,
    ) -> BoxFuture<'a, Result<JsonValue, String>>;

    fn patch<'a>(
        &'a self,
        endpoint: &'a ControllerEndpoint,
        path: &'a str,
        body: JsonValue,
    ) -> BoxFuture<'a, Result<(), String>>;
}

/// State read from the kernel once it is up.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ControlSnapshot {
    pub configs: JsonValue,
    pub proxies: JsonValue,
}

/// `GET /configs` and `GET /proxies`, both required.
pub async fn snapshot(api: &dyn ControlApi, endpoint: &ControllerEndpoint) -> Result<ControlSnapshot, String> {
    let (configs, proxies) =
        futures::future::try_join(api.get(endpoint, "/configs"), api.get(endpoint, "/proxies")).await?;
    Ok(ControlSnapshot { configs, proxies })
}

#[derive(Deserialize)]
struct ErrorResponseBody {
    #[serde(default)]
    message: Option<String>,
}

fn map_error_from_body(status: u16, body: &str) -> String {
    if body.is_empty() {
        return format!("kernel returned {status} with empty body");
    }
    match serde_json::from_str::<ErrorResponseBody>(body) {
        Ok(err_body) => err_body
            .message
            .unwrap_or_else(|| format!("kernel returned status {status}")),
        Err(_) => format!("kernel returned status {status}: {body}"),
    }
}

pub struct HttpControlApi {
    client: reqwest::Client,
}

impl HttpControlApi {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        endpoint: &ControllerEndpoint,
    ) -> Result<String, String> {
        let resp = request
            .bearer_auth(&endpoint.secret)
            .send()
            .await
            .map_err(|err| format!("failed to reach kernel controller at {}: {err}", endpoint.base_url))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|err| format!("failed to read kernel response: {err}"))?;
        if (200..300).contains(&status) {
            Ok(body)
        } else {
            Err(map_error_from_body(status, &body))
        }
    }
}

impl ControlApi for HttpControlApi {
    fn get<'a>(
        &'a self,
        endpoint: &'a ControllerEndpoint,
        path: &'a str,
    ) -> BoxFuture<'a, Result<JsonValue, String>> {
        Box::pin(async move {
            let body = self.send(self.client.get(endpoint.url(path)), endpoint).await?;
            serde_json::from_str(&body).map_err(|err| format!("failed to parse kernel response for {path}: {err}"))
        })
    }

    fn patch<'a>(
        &'a self,
        endpoint: &'a ControllerEndpoint,
        path: &'a str,
        body: JsonValue,
    ) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async move {
            self.send(self.client.patch(endpoint.url(path)).json(&body), endpoint)
                .await
                .map(|_| ())
        })
    }
}

/// Host-wide proxy settings. Engaged while the kernel runs when the user asks
/// for it and TUN mode is off.
pub trait SystemProxy: Send + Sync {
    fn set(&self, mixed_port: u16) -> Result<(), String>;
    fn clear(&self) -> Result<(), String>;
}

/// Used on hosts where corepilot does not manage the system proxy.
pub struct NoopSystemProxy;

impl SystemProxy for NoopSystemProxy {
    fn set(&self, mixed_port: u16) -> Result<(), String> {
        tracing::debug!("system proxy is not managed on this host (mixed-port {mixed_port})");
        Ok(())
    }

    fn clear(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Serialize)]
pub struct ProxyNodeDto {
    pub name: String,
    #[serde(rename = "type")]
    pub proxy_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u32>,
}

#[derive(Serialize)]
pub struct ProxyGroupDto {
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub now: Option<String>,
    pub nodes: Vec<ProxyNodeDto>,
}

#[derive(Deserialize)]
struct ProxiesRaw {
    proxies: HashMap<String, ProxyRaw>,
}

#[derive(Deserialize)]
struct ProxyRaw {
    name: String,
    #[serde(rename = "type")]
    proxy_type: Option<String>,
    #[serde(default)]
    all: Option<Vec<String>>,
    #[serde(default)]
    now: Option<String>,
    #[serde(default)]
    history: Vec<DelayEntry>,
}

#[derive(Deserialize)]
struct DelayEntry {
    #[serde(default)]
    delay: Option<u32>,
}

/// Groups (entries with an `all` list) from a `GET /proxies` body, each with
/// its members and their latest delay. `GLOBAL` is left out.
pub fn group_view(proxies: &JsonValue) -> Result<Vec<ProxyGroupDto>, String> {
    let raw: ProxiesRaw = serde_json::from_value(proxies.clone())
        .map_err(|err| format!("unexpected /proxies payload: {err}"))?;

    let node = |name: &str| {
        let entry = raw.proxies.get(name);
        ProxyNodeDto {
            name: name.to_string(),
            proxy_type: entry
                .and_then(|p| p.proxy_type.clone())
                .unwrap_or_default(),
            delay: entry
                .and_then(|p| p.history.last())
                .and_then(|h| h.delay)
                .filter(|d| *d > 0),
        }
    };

    let mut groups: Vec<ProxyGroupDto> = raw
        .proxies
        .values()
        .filter(|p| p.name != "GLOBAL")
        .filter_map(|p| {
            let members = p.all.as_ref()?;
            Some(ProxyGroupDto {
                name: p.name.clone(),
                group_type: p.proxy_type.clone().unwrap_or_default(),
                now: p.now.clone(),
                nodes: members.iter().map(|m| node(m)).collect(),
            })
        })
        .collect();
    groups.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_uses_loopback_for_wildcards() {
        let mut advanced = AdvancedConfig::default();
        advanced.external_controller = "0.0.0.0:9090".to_string();
        advanced.secret = "s3cret".to_string();
        let endpoint = ControllerEndpoint::from_config(&advanced);
        assert_eq!(endpoint.base_url, "http://127.0.0.1:9090");
        assert_eq!(endpoint.url("/configs"), "http://127.0.0.1:9090/configs");

        advanced.external_controller = ":20113".to_string();
        assert_eq!(ControllerEndpoint::from_config(&advanced).base_url, "http://127.0.0.1:20113");

        advanced.external_controller = "192.168.1.2:20113".to_string();
        assert_eq!(ControllerEndpoint::from_config(&advanced).base_url, "http://192.168.1.2:20113");
    }

    #[test]
    fn error_body_message_is_preferred() {
        assert_eq!(map_error_from_body(401, r#"{"message":"Unauthorized"}"#), "Unauthorized");
        assert_eq!(map_error_from_body(502, ""), "kernel returned 502 with empty body");
        assert_eq!(map_error_from_body(500, "boom"), "kernel returned status 500: boom");
    }

    #[test]
    fn group_view_lists_groups_with_delays() {
        let proxies = serde_json::json!({
            "proxies": {
                "GLOBAL": { "name": "GLOBAL", "type": "Selector", "all": ["🚀 Select"] },
                "🚀 Select": { "name": "🚀 Select", "type": "Selector", "now": "HK 01", "all": ["HK 01", "DIRECT"] },
                "HK 01": { "name": "HK 01", "type": "Shadowsocks", "history": [{ "delay": 0 }, { "delay": 87 }] },
                "DIRECT": { "name": "DIRECT", "type": "Direct", "history": [] }
            }
        });
        let groups = group_view(&proxies).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].now.as_deref(), Some("HK 01"));
        assert_eq!(groups[0].nodes[0].delay, Some(87));
        assert_eq!(groups[0].nodes[1].delay, None);
        assert_eq!(groups[0].nodes[1].proxy_type, "Direct");
    }
}
