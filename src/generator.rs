use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Serialize;
use serde_json::Value as JsonValue;
use serde_yaml::{Mapping, Value};

use crate::ids::{is_built_in, resolve_name};
use crate::plugins::PluginError;
use crate::profiles::{
    DnsConfig, Profile, ProxyGroup, ProxyGroupType, Rule, RuleType, RulesetSourceKind, RULE_SET_MARKER,
};
use crate::rulesets::Ruleset;
use crate::subscriptions::{read_cached_proxies, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("inline ruleset [{name}] is not valid YAML: {message}")]
    InlineRuleset { name: String, message: String },
    #[error("failed to serialize {section}: {message}")]
    Serialize { section: &'static str, message: String },
    #[error("mixin is not valid YAML: {0}")]
    Mixin(String),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error("script error: {0}")]
    Script(String),
    #[error("profile [{0}] has a custom script but no script runtime is configured; restore the default script to generate it")]
    ScriptRuntimeUnavailable(String),
    #[error("{0}")]
    Write(String),
}

/// Read-only view of the subscription and ruleset stores.
#[derive(Default)]
pub struct Catalog {
    pub subscriptions: Vec<Subscription>,
    pub rulesets: Vec<Ruleset>,
    /// Full proxy records per subscription ID, as cached on disk.
    pub proxies: HashMap<String, Vec<JsonValue>>,
}

impl Catalog {
    /// Snapshots the stores and reads the proxy caches of the subscriptions
    /// `profile` draws members from. Unreadable caches contribute no proxies.
    pub fn load(
        profile: &Profile,
        subscriptions: Vec<Subscription>,
        rulesets: Vec<Ruleset>,
        data_root: &Path,
    ) -> Self {
        let wanted: HashSet<&str> = profile
            .proxy_groups_config
            .iter()
            .flat_map(|g| g.proxies.iter().filter_map(|m| m.subscription_id()))
            .collect();

        let mut proxies = HashMap::new();
        for sub in subscriptions.iter().filter(|s| wanted.contains(s.id.as_str())) {
            match read_cached_proxies(data_root, sub) {
                Ok(list) => {
                    proxies.insert(sub.id.clone(), list);
                }
                Err(err) => tracing::warn!("subscription [{}] has no usable cache: {err}", sub.name),
            }
        }

        Self {
            subscriptions,
            rulesets,
            proxies,
        }
    }

    pub fn subscription(&self, id: &str) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.id == id)
    }

    pub fn ruleset(&self, id: &str) -> Option<&Ruleset> {
        self.rulesets.iter().find(|r| r.id == id)
    }

    pub fn ruleset_by_id_or_name(&self, key: &str) -> Option<&Ruleset> {
        self.ruleset(key)
            .or_else(|| self.rulesets.iter().find(|r| r.name == key))
    }
}

fn key(k: &str) -> Value {
    Value::String(k.to_string())
}

fn to_mapping<T: Serialize>(section: &'static str, value: &T) -> Result<Mapping, GenerateError> {
    match serde_yaml::to_value(value) {
        Ok(Value::Mapping(map)) => Ok(map),
        Ok(_) => Err(GenerateError::Serialize {
            section,
            message: "expected a mapping".to_string(),
        }),
        Err(err) => Err(GenerateError::Serialize {
            section,
            message: err.to_string(),
        }),
    }
}

/// `a,b` becomes a list, a lone value stays a scalar.
fn expand_list(value: &str) -> Value {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    if parts.len() == 1 {
        Value::String(parts[0].to_string())
    } else {
        Value::Sequence(parts.into_iter().map(|p| Value::String(p.to_string())).collect())
    }
}

/// Provider paths are written relative to the kernel's working directory.
fn provider_path(rel: &str) -> String {
    format!("../{}", rel.trim_start_matches("./"))
}

struct Compiler<'a> {
    profile: &'a Profile,
    catalog: &'a Catalog,
}

/// Compiles `profile` into the kernel document. Pure: the same profile and
/// catalog always give the same document.
pub fn compile(profile: &Profile, catalog: &Catalog) -> Result<Value, GenerateError> {
    Compiler { profile, catalog }.run()
}

impl<'a> Compiler<'a> {
    fn group_name(&self, id: &str) -> Option<&'a str> {
        self.profile.group_name(id)
    }

    fn run(&self) -> Result<Value, GenerateError> {
        let mut root = to_mapping("general config", &self.profile.general_config)?;
        for (k, v) in to_mapping("advanced config", &self.profile.advanced_config)? {
            root.insert(k, v);
        }

        root.insert(
            key("tun"),
            Value::Mapping(to_mapping("tun config", &self.profile.tun_config)?),
        );

        let (dns, hosts) = self.dns()?;
        root.insert(key("dns"), Value::Mapping(dns));
        root.insert(key("hosts"), Value::Mapping(hosts));

        root.insert(key("proxy-providers"), Value::Mapping(self.proxy_providers()));
        root.insert(key("rule-providers"), Value::Mapping(self.rule_providers()?));
        root.insert(key("proxies"), Value::Sequence(self.proxies()?));
        root.insert(
            key("proxy-groups"),
            Value::Sequence(
                self.profile
                    .proxy_groups_config
                    .iter()
                    .map(|g| Value::Mapping(self.proxy_group(g)))
                    .collect(),
            ),
        );
        root.insert(key("rules"), Value::Sequence(self.rules()));

        Ok(Value::Mapping(root))
    }

    /// Returns the cleaned `dns` section and the root-level `hosts`.
    fn dns(&self) -> Result<(Mapping, Mapping), GenerateError> {
        let cfg: &DnsConfig = &self.profile.dns_config;
        let mut dns = to_mapping("dns config", cfg)?;

        if cfg.listen.is_empty() {
            dns.remove("listen");
        }
        if cfg.default_nameserver.is_empty() {
            dns.remove("default-nameserver");
        }
        if cfg.nameserver.is_empty() {
            dns.remove("nameserver");
        }
        if cfg.fallback.is_empty() {
            dns.remove("fallback");
            dns.remove("fallback-filter");
        }
        if cfg.proxy_server_nameserver.is_empty() {
            dns.remove("proxy-server-nameserver");
        }

        dns.remove("hosts");
        let hosts: Mapping = cfg
            .hosts
            .iter()
            .map(|(host, addrs)| (key(host), expand_list(addrs)))
            .collect();

        let policy: Mapping = cfg
            .nameserver_policy
            .iter()
            .map(|(k, servers)| (key(k), expand_list(servers)))
            .collect();
        dns.insert(key("nameserver-policy"), Value::Mapping(policy));

        Ok((dns, hosts))
    }

    /// Subscriptions consumed through group `use` lists, in first-use order.
    fn proxy_providers(&self) -> Mapping {
        let mut providers = Mapping::new();
        for id in self.profile.proxy_groups_config.iter().flat_map(|g| g.r#use.iter()) {
            if providers.contains_key(id.as_str()) {
                continue;
            }
            let Some(sub) = self.catalog.subscription(id) else {
                continue;
            };
            let mut provider = Mapping::new();
            provider.insert(key("type"), key("file"));
            provider.insert(key("path"), key(&provider_path(&sub.path)));
            let mut health = Mapping::new();
            health.insert(key("enable"), Value::Bool(sub.health_check.enable));
            health.insert(key("url"), key(&sub.health_check.url));
            health.insert(key("interval"), Value::from(sub.health_check.interval));
            provider.insert(key("health-check"), Value::Mapping(health));
            providers.insert(key(&sub.id), Value::Mapping(provider));
        }
        providers
    }

    fn local_rule_provider(&self, reference: &str) -> Option<(String, Mapping)> {
        let ruleset = self.catalog.ruleset_by_id_or_name(reference)?;
        let mut provider = Mapping::new();
        provider.insert(key("type"), key("file"));
        provider.insert(key("behavior"), key(ruleset.behavior.as_str()));
        provider.insert(key("path"), key(&provider_path(&ruleset.path)));
        provider.insert(key("format"), key(ruleset.format.as_str()));
        Some((ruleset.name.clone(), provider))
    }

    fn rule_provider(&self, rule: &Rule) -> Result<Option<(String, Mapping)>, GenerateError> {
        match rule.ruleset_type {
            RulesetSourceKind::File => Ok(self.local_rule_provider(&rule.payload)),
            RulesetSourceKind::Http => {
                let proxy = if is_built_in(&rule.ruleset_proxy) {
                    rule.ruleset_proxy.clone()
                } else {
                    self.group_name(&rule.ruleset_proxy)
                        .unwrap_or("DIRECT")
                        .to_string()
                };
                let mut provider = Mapping::new();
                provider.insert(key("type"), key("http"));
                provider.insert(key("url"), key(&rule.payload));
                provider.insert(key("behavior"), key(rule.ruleset_behavior.as_str()));
                provider.insert(key("format"), key(rule.ruleset_format.as_str()));
                provider.insert(key("proxy"), key(&proxy));
                Ok(Some((rule.ruleset_name.clone(), provider)))
            }
            RulesetSourceKind::Inline => {
                let payload: Value = serde_yaml::from_str(&rule.payload).map_err(|err| {
                    GenerateError::InlineRuleset {
                        name: rule.ruleset_name.clone(),
                        message: err.to_string(),
                    }
                })?;
                let mut provider = Mapping::new();
                provider.insert(key("type"), key("inline"));
                provider.insert(key("behavior"), key(rule.ruleset_behavior.as_str()));
                provider.insert(key("payload"), payload);
                Ok(Some((rule.ruleset_name.clone(), provider)))
            }
        }
    }

    fn rule_providers(&self) -> Result<Mapping, GenerateError> {
        let mut providers = Mapping::new();
        let mut add = |entry: Option<(String, Mapping)>| {
            if let Some((name, provider)) = entry {
                if !providers.contains_key(name.as_str()) {
                    providers.insert(key(&name), Value::Mapping(provider));
                }
            }
        };

        for rule in self
            .profile
            .rules_config
            .iter()
            .filter(|r| r.rule_type == RuleType::RuleSet)
        {
            add(self.rule_provider(rule)?);
        }

        let dns = &self.profile.dns_config;
        let from_filter = dns
            .fake_ip_filter
            .iter()
            .filter_map(|entry| entry.strip_prefix(RULE_SET_MARKER))
            .map(str::to_string);
        let from_policy = dns
            .nameserver_policy
            .keys()
            .filter_map(|k| k.strip_prefix(RULE_SET_MARKER))
            .flat_map(|names| names.split(',').map(|n| n.trim().to_string()));
        for name in from_filter.chain(from_policy).collect::<Vec<_>>() {
            add(self.local_rule_provider(&name));
        }

        Ok(providers)
    }

    /// Full records of every subscription proxy a group lists explicitly.
    /// The first proxy with a given name wins.
    fn proxies(&self) -> Result<Vec<Value>, GenerateError> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut out = Vec::new();

        for member in self
            .profile
            .proxy_groups_config
            .iter()
            .flat_map(|g| g.proxies.iter())
        {
            let Some(sub_id) = member.subscription_id() else {
                continue;
            };
            let Some(records) = self.catalog.proxies.get(sub_id) else {
                continue;
            };
            let Some(record) = records
                .iter()
                .find(|p| p.get("name").and_then(JsonValue::as_str) == Some(member.name.as_str()))
            else {
                continue;
            };
            if !seen.insert(member.name.as_str()) {
                continue;
            }
            let value = serde_yaml::to_value(record).map_err(|err| GenerateError::Serialize {
                section: "proxies",
                message: err.to_string(),
            })?;
            out.push(value);
        }

        Ok(out)
    }

    fn proxy_group(&self, group: &ProxyGroup) -> Mapping {
        let mut out = Mapping::new();
        out.insert(key("name"), key(&group.name));
        out.insert(key("type"), key(group.group_type.as_str()));
        out.insert(key("filter"), key(&group.filter));
        out.insert(key("exclude-filter"), key(&group.exclude_filter));
        out.insert(key("hidden"), Value::Bool(group.hidden));
        out.insert(key("icon"), key(&group.icon));

        if !group.r#use.is_empty() {
            out.insert(
                key("use"),
                Value::Sequence(group.r#use.iter().map(|id| key(id)).collect()),
            );
        }

        if !group.proxies.is_empty() {
            let members = group
                .proxies
                .iter()
                .map(|m| key(&resolve_name(&m.id, &m.name, |id| self.group_name(id))))
                .collect();
            out.insert(key("proxies"), Value::Sequence(members));
        }

        let health_check = |out: &mut Mapping| {
            out.insert(key("url"), key(&group.url));
            out.insert(key("interval"), Value::from(group.interval));
            out.insert(key("tolerance"), Value::from(group.tolerance));
            out.insert(key("lazy"), Value::Bool(group.lazy));
            out.insert(key("disable-udp"), Value::Bool(group.disable_udp));
        };

        match group.group_type {
            ProxyGroupType::Select => {
                out.insert(key("disable-udp"), Value::Bool(group.disable_udp));
            }
            ProxyGroupType::UrlTest | ProxyGroupType::Fallback => health_check(&mut out),
            ProxyGroupType::LoadBalance => {
                health_check(&mut out);
                out.insert(key("strategy"), key(&group.strategy));
            }
            ProxyGroupType::Relay => {}
        }

        out
    }

    fn rules(&self) -> Vec<Value> {
        let geodata = self.profile.advanced_config.geodata_mode;
        self.profile
            .rules_config
            .iter()
            .filter(|r| geodata || !r.rule_type.is_geo())
            .map(|r| Value::String(self.render_rule(r)))
            .collect()
    }

    pub(crate) fn render_rule(&self, rule: &Rule) -> String {
        let mut line = match rule.rule_type {
            RuleType::Match => RuleType::Match.as_str().to_string(),
            RuleType::Logic => rule.payload.clone(),
            RuleType::RuleSet => {
                let name = match rule.ruleset_type {
                    RulesetSourceKind::File => self
                        .catalog
                        .ruleset_by_id_or_name(&rule.payload)
                        .map(|r| r.name.as_str())
                        .unwrap_or(rule.payload.as_str()),
                    RulesetSourceKind::Http | RulesetSourceKind::Inline => rule.ruleset_name.as_str(),
                };
                format!("RULE-SET,{name}")
            }
            other => format!("{},{}", other.as_str(), rule.payload),
        };

        line.push(',');
        line.push_str(&resolve_name(&rule.proxy, "", |id| self.group_name(id)));

        if rule.no_resolve && rule.rule_type.supports_no_resolve() {
            line.push_str(",no-resolve");
        }
        line
    }
}

/// Renders a single rule line the way [`compile`] does.
pub fn render_rule(rule: &Rule, profile: &Profile, catalog: &Catalog) -> String {
    Compiler { profile, catalog }.render_rule(rule)
}
