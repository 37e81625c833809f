use std::collections::BTreeMap;

use axum::{extract::Path, Json};
use serde::{Deserialize, Serialize};

use crate::app::app_state;
use crate::ids::{new_id, BUILT_IN_SOURCE};
use crate::store::Identified;
use crate::{ApiResponse, ConfigChangeReason};

pub const DEFAULT_TEST_URL: &str = "https://www.gstatic.com/generate_204";

/// The stock script: hands the generated config back untouched.
pub const DEFAULT_GENERATE_SCRIPT: &str =
    "const onGenerate = async (config) => {\n  return config\n}";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub general_config: GeneralConfig,
    pub advanced_config: AdvancedConfig,
    pub tun_config: TunConfig,
    pub dns_config: DnsConfig,
    #[serde(default)]
    pub proxy_groups_config: Vec<ProxyGroup>,
    #[serde(default)]
    pub rules_config: Vec<Rule>,
    #[serde(default)]
    pub mixin_config: MixinConfig,
    #[serde(default)]
    pub script_config: ScriptConfig,
}

impl Identified for Profile {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct GeneralConfig {
    pub mode: String,
    pub ipv6: bool,
    pub mixed_port: u16,
    pub allow_lan: bool,
    pub log_level: String,
    pub interface_name: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            mode: "rule".to_string(),
            ipv6: false,
            mixed_port: 20112,
            allow_lan: false,
            log_level: "silent".to_string(),
            interface_name: String::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct TlsConfig {
    pub certificate: String,
    pub private_key: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct GeoxUrl {
    pub geoip: String,
    pub geosite: String,
    pub mmdb: String,
    pub asn: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct StoreProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_selected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_fake_ip: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct AdvancedConfig {
    pub port: u16,
    pub socks_port: u16,
    pub secret: String,
    pub external_controller: String,
    #[serde(default)]
    pub external_controller_tls: String,
    #[serde(default)]
    pub external_ui: String,
    #[serde(default)]
    pub external_ui_name: String,
    #[serde(default)]
    pub external_ui_url: String,
    pub keep_alive_interval: u32,
    pub find_process_mode: String,
    pub unified_delay: bool,
    pub tcp_concurrent: bool,
    #[serde(default)]
    pub authentication: Vec<String>,
    #[serde(default)]
    pub skip_auth_prefixes: Vec<String>,
    #[serde(default)]
    pub tls: TlsConfig,
    pub global_client_fingerprint: String,
    pub geodata_mode: bool,
    pub geo_auto_update: bool,
    pub geo_update_interval: u32,
    pub geodata_loader: String,
    pub geosite_matcher: String,
    #[serde(default)]
    pub geox_url: GeoxUrl,
    pub global_ua: String,
    #[serde(default)]
    pub profile: StoreProfile,
    #[serde(default)]
    pub lan_allowed_ips: Vec<String>,
    #[serde(default)]
    pub lan_disallowed_ips: Vec<String>,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        const RULES_CDN: &str = "https://testingcf.jsdelivr.net/gh/MetaCubeX/meta-rules-dat@release";
        Self {
            port: 0,
            socks_port: 0,
            secret: new_id(),
            external_controller: "127.0.0.1:20113".to_string(),
            external_controller_tls: String::new(),
            external_ui: String::new(),
            external_ui_name: String::new(),
            external_ui_url: String::new(),
            keep_alive_interval: 30,
            find_process_mode: "strict".to_string(),
            unified_delay: true,
            tcp_concurrent: true,
            authentication: Vec::new(),
            skip_auth_prefixes: vec!["127.0.0.1/8".to_string(), "::1/128".to_string()],
            tls: TlsConfig::default(),
            global_client_fingerprint: "chrome".to_string(),
            geodata_mode: true,
            geo_auto_update: false,
            geo_update_interval: 24,
            geodata_loader: "standard".to_string(),
            geosite_matcher: "mph".to_string(),
            geox_url: GeoxUrl {
                geoip: format!("{RULES_CDN}/geoip.dat"),
                geosite: format!("{RULES_CDN}/geosite.dat"),
                mmdb: format!("{RULES_CDN}/country.mmdb"),
                asn: "https://github.com/xishang0128/geoip/releases/download/latest/GeoLite2-ASN.mmdb"
                    .to_string(),
            },
            global_ua: "chrome".to_string(),
            profile: StoreProfile {
                store_selected: Some(true),
                store_fake_ip: Some(true),
            },
            lan_allowed_ips: vec!["0.0.0.0/0".to_string(), "::/0".to_string()],
            lan_disallowed_ips: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct TunConfig {
    pub enable: bool,
    pub stack: String,
    pub auto_route: bool,
    #[serde(default)]
    pub route_address: Vec<String>,
    #[serde(default)]
    pub route_exclude_address: Vec<String>,
    pub auto_detect_interface: bool,
    #[serde(default)]
    pub dns_hijack: Vec<String>,
    pub device: String,
    pub mtu: u32,
    pub strict_route: bool,
    pub endpoint_independent_nat: bool,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            enable: false,
            stack: "Mixed".to_string(),
            auto_route: true,
            route_address: ["0.0.0.0/1", "128.0.0.0/1", "::/1", "8000::/1"]
                .map(String::from)
                .to_vec(),
            route_exclude_address: Vec::new(),
            auto_detect_interface: true,
            dns_hijack: vec!["any:53".to_string()],
            device: "utun_clash".to_string(),
            mtu: 9000,
            strict_route: true,
            endpoint_independent_nat: false,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct FallbackFilter {
    pub geoip: bool,
    pub geoip_code: String,
    #[serde(default)]
    pub geosite: Vec<String>,
    #[serde(default)]
    pub ipcidr: Vec<String>,
    #[serde(default)]
    pub domain: Vec<String>,
}

impl Default for FallbackFilter {
    fn default() -> Self {
        Self {
            geoip: true,
            geoip_code: "CN".to_string(),
            geosite: vec!["gfw".to_string()],
            ipcidr: vec!["240.0.0.0/4".to_string()],
            domain: ["+.google.com", "+.facebook.com", "+.youtube.com"]
                .map(String::from)
                .to_vec(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct DnsConfig {
    pub enable: bool,
    #[serde(default)]
    pub listen: String,
    pub ipv6: bool,
    pub use_hosts: bool,
    pub use_system_hosts: bool,
    #[serde(default)]
    pub default_nameserver: Vec<String>,
    #[serde(default)]
    pub nameserver: Vec<String>,
    #[serde(default)]
    pub proxy_server_nameserver: Vec<String>,
    /// Free-form: `domain or rule-set:name -> comma separated servers`.
    #[serde(default)]
    pub nameserver_policy: BTreeMap<String, String>,
    pub enhanced_mode: String,
    pub fake_ip_range: String,
    pub fake_ip_filter_mode: String,
    #[serde(default)]
    pub fake_ip_filter: Vec<String>,
    pub prefer_h3: bool,
    #[serde(default)]
    pub fallback: Vec<String>,
    #[serde(default)]
    pub fallback_filter: FallbackFilter,
    /// Free-form: `host -> comma separated addresses`.
    #[serde(default)]
    pub hosts: BTreeMap<String, String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            listen: String::new(),
            ipv6: false,
            use_hosts: false,
            use_system_hosts: true,
            default_nameserver: Vec::new(),
            nameserver: vec!["https://223.5.5.5/dns-query".to_string()],
            proxy_server_nameserver: Vec::new(),
            nameserver_policy: BTreeMap::new(),
            enhanced_mode: "fake-ip".to_string(),
            fake_ip_range: "198.18.0.1/16".to_string(),
            fake_ip_filter_mode: "blacklist".to_string(),
            fake_ip_filter: [
                "*.lan",
                "*.localdomain",
                "*.example",
                "*.invalid",
                "*.localhost",
                "*.test",
                "*.local",
                "*.home.arpa",
                "*.msftconnecttest.com",
                "*.msftncsi.com",
            ]
            .map(String::from)
            .to_vec(),
            prefer_h3: false,
            fallback: Vec::new(),
            fallback_filter: FallbackFilter::default(),
            hosts: BTreeMap::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyGroupType {
    Select,
    UrlTest,
    Fallback,
    Relay,
    LoadBalance,
}

impl ProxyGroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyGroupType::Select => "select",
            ProxyGroupType::UrlTest => "url-test",
            ProxyGroupType::Fallback => "fallback",
            ProxyGroupType::Relay => "relay",
            ProxyGroupType::LoadBalance => "load-balance",
        }
    }
}

/// One entry of a group's member list.
///
/// `source` is [`BUILT_IN_SOURCE`] for built-in outbounds and other groups
/// (then `id` is the outbound name or the group ID), otherwise it is the ID
/// of the subscription `name` was taken from.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GroupMember {
    pub id: String,
    #[serde(rename = "type")]
    pub source: String,
    pub name: String,
}

impl GroupMember {
    pub fn built_in(name: &str) -> Self {
        Self {
            id: name.to_string(),
            source: BUILT_IN_SOURCE.to_string(),
            name: name.to_string(),
        }
    }

    pub fn group(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            source: BUILT_IN_SOURCE.to_string(),
            name: name.to_string(),
        }
    }

    pub fn proxy(subscription_id: &str, proxy_id: &str, name: &str) -> Self {
        Self {
            id: proxy_id.to_string(),
            source: subscription_id.to_string(),
            name: name.to_string(),
        }
    }

    pub fn subscription_id(&self) -> Option<&str> {
        if self.source == BUILT_IN_SOURCE {
            None
        } else {
            Some(&self.source)
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyGroup {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: ProxyGroupType,
    #[serde(default)]
    pub proxies: Vec<GroupMember>,
    /// Subscription IDs consumed as proxy providers.
    #[serde(default)]
    pub r#use: Vec<String>,
    pub url: String,
    pub interval: u32,
    pub strategy: String,
    pub tolerance: u32,
    pub lazy: bool,
    pub disable_udp: bool,
    #[serde(default)]
    pub filter: String,
    #[serde(default)]
    pub exclude_filter: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub icon: String,
}

impl ProxyGroup {
    pub fn new(id: &str, name: &str, group_type: ProxyGroupType) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            group_type,
            proxies: Vec::new(),
            r#use: Vec::new(),
            url: DEFAULT_TEST_URL.to_string(),
            interval: 300,
            strategy: "consistent-hashing".to_string(),
            tolerance: 150,
            lazy: true,
            disable_udp: false,
            filter: String::new(),
            exclude_filter: String::new(),
            hidden: false,
            icon: String::new(),
        }
    }

    pub fn uses_subscription(&self, subscription_id: &str) -> bool {
        self.r#use.iter().any(|id| id == subscription_id)
            || self
                .proxies
                .iter()
                .any(|m| m.subscription_id() == Some(subscription_id))
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuleType {
    #[serde(rename = "DOMAIN")]
    Domain,
    #[serde(rename = "DOMAIN-SUFFIX")]
    DomainSuffix,
    #[serde(rename = "DOMAIN-KEYWORD")]
    DomainKeyword,
    #[serde(rename = "DOMAIN-REGEX")]
    DomainRegex,
    #[serde(rename = "GEOSITE")]
    Geosite,
    #[serde(rename = "GEOIP")]
    Geoip,
    #[serde(rename = "IP-CIDR")]
    IpCidr,
    #[serde(rename = "IP-CIDR6")]
    IpCidr6,
    #[serde(rename = "IP-SUFFIX")]
    IpSuffix,
    #[serde(rename = "IP-ASN")]
    IpAsn,
    #[serde(rename = "SRC-GEOIP")]
    SrcGeoip,
    #[serde(rename = "SRC-IP-ASN")]
    SrcIpAsn,
    #[serde(rename = "SRC-IP-CIDR")]
    SrcIpCidr,
    #[serde(rename = "SRC-IP-SUFFIX")]
    SrcIpSuffix,
    #[serde(rename = "DST-PORT")]
    DstPort,
    #[serde(rename = "SRC-PORT")]
    SrcPort,
    #[serde(rename = "IN-PORT")]
    InPort,
    #[serde(rename = "IN-TYPE")]
    InType,
    #[serde(rename = "IN-USER")]
    InUser,
    #[serde(rename = "IN-NAME")]
    InName,
    #[serde(rename = "PROCESS-PATH")]
    ProcessPath,
    #[serde(rename = "PROCESS-PATH-REGEX")]
    ProcessPathRegex,
    #[serde(rename = "PROCESS-NAME")]
    ProcessName,
    #[serde(rename = "PROCESS-NAME-REGEX")]
    ProcessNameRegex,
    #[serde(rename = "UID")]
    Uid,
    #[serde(rename = "NETWORK")]
    Network,
    #[serde(rename = "DSCP")]
    Dscp,
    #[serde(rename = "RULE-SET")]
    RuleSet,
    #[serde(rename = "LOGIC")]
    Logic,
    #[serde(rename = "SUB-RULE")]
    SubRule,
    #[serde(rename = "MATCH")]
    Match,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Domain => "DOMAIN",
            RuleType::DomainSuffix => "DOMAIN-SUFFIX",
            RuleType::DomainKeyword => "DOMAIN-KEYWORD",
            RuleType::DomainRegex => "DOMAIN-REGEX",
            RuleType::Geosite => "GEOSITE",
            RuleType::Geoip => "GEOIP",
            RuleType::IpCidr => "IP-CIDR",
            RuleType::IpCidr6 => "IP-CIDR6",
            RuleType::IpSuffix => "IP-SUFFIX",
            RuleType::IpAsn => "IP-ASN",
            RuleType::SrcGeoip => "SRC-GEOIP",
            RuleType::SrcIpAsn => "SRC-IP-ASN",
            RuleType::SrcIpCidr => "SRC-IP-CIDR",
            RuleType::SrcIpSuffix => "SRC-IP-SUFFIX",
            RuleType::DstPort => "DST-PORT",
            RuleType::SrcPort => "SRC-PORT",
            RuleType::InPort => "IN-PORT",
            RuleType::InType => "IN-TYPE",
            RuleType::InUser => "IN-USER",
            RuleType::InName => "IN-NAME",
            RuleType::ProcessPath => "PROCESS-PATH",
            RuleType::ProcessPathRegex => "PROCESS-PATH-REGEX",
            RuleType::ProcessName => "PROCESS-NAME",
            RuleType::ProcessNameRegex => "PROCESS-NAME-REGEX",
            RuleType::Uid => "UID",
            RuleType::Network => "NETWORK",
            RuleType::Dscp => "DSCP",
            RuleType::RuleSet => "RULE-SET",
            RuleType::Logic => "LOGIC",
            RuleType::SubRule => "SUB-RULE",
            RuleType::Match => "MATCH",
        }
    }

    /// The single table of rule types that accept a trailing `no-resolve`.
    pub fn supports_no_resolve(&self) -> bool {
        matches!(
            self,
            RuleType::Geoip
                | RuleType::IpCidr
                | RuleType::IpCidr6
                | RuleType::RuleSet
                | RuleType::IpAsn
        )
    }

    /// Rules the kernel can only evaluate with geodata loaded.
    pub fn is_geo(&self) -> bool {
        self.as_str().starts_with("GEO")
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RulesetSourceKind {
    #[default]
    File,
    Http,
    Inline,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RulesetBehavior {
    #[default]
    Domain,
    Ipcidr,
    Classical,
}

impl RulesetBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            RulesetBehavior::Domain => "domain",
            RulesetBehavior::Ipcidr => "ipcidr",
            RulesetBehavior::Classical => "classical",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RulesetFormat {
    #[default]
    Yaml,
    Mrs,
}

impl RulesetFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            RulesetFormat::Yaml => "yaml",
            RulesetFormat::Mrs => "mrs",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Rule {
    pub id: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default)]
    pub payload: String,
    /// Target: a proxy group ID or a built-in outbound.
    pub proxy: String,
    #[serde(default)]
    pub no_resolve: bool,
    #[serde(default)]
    pub ruleset_type: RulesetSourceKind,
    #[serde(default)]
    pub ruleset_name: String,
    #[serde(default)]
    pub ruleset_behavior: RulesetBehavior,
    #[serde(default)]
    pub ruleset_format: RulesetFormat,
    /// Group ID used to fetch an http rule provider; DIRECT when empty or dangling.
    #[serde(default)]
    pub ruleset_proxy: String,
}

impl Rule {
    pub fn new(rule_type: RuleType, payload: &str, proxy: &str) -> Self {
        Self {
            id: new_id(),
            rule_type,
            payload: payload.to_string(),
            proxy: proxy.to_string(),
            no_resolve: false,
            ruleset_type: RulesetSourceKind::File,
            ruleset_name: String::new(),
            ruleset_behavior: RulesetBehavior::Domain,
            ruleset_format: RulesetFormat::Yaml,
            ruleset_proxy: String::new(),
        }
    }

    pub fn no_resolve(mut self) -> Self {
        self.no_resolve = true;
        self
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MixinPriority {
    #[default]
    Mixin,
    Gui,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MixinFormat {
    #[default]
    Yaml,
    Json,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MixinConfig {
    #[serde(default)]
    pub priority: MixinPriority,
    #[serde(default)]
    pub format: MixinFormat,
    #[serde(default)]
    pub config: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ScriptConfig {
    #[serde(default)]
    pub code: String,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            code: DEFAULT_GENERATE_SCRIPT.to_string(),
        }
    }
}

impl Profile {
    /// Builds a profile with the stock groups, rules, DNS and TUN sections.
    pub fn with_defaults(name: &str) -> Self {
        let ids: Vec<String> = (0..5).map(|_| new_id()).collect();
        let (select, auto, direct, reject, fallback) = (&ids[0], &ids[1], &ids[2], &ids[3], &ids[4]);

        let mut select_group = ProxyGroup::new(select, "🚀 Select", ProxyGroupType::Select);
        select_group.proxies = vec![GroupMember::group(auto, "🎈 Auto")];

        let auto_group = ProxyGroup::new(auto, "🎈 Auto", ProxyGroupType::UrlTest);

        let mut direct_group = ProxyGroup::new(direct, "🎯 Direct", ProxyGroupType::Select);
        direct_group.proxies = vec![GroupMember::built_in("DIRECT"), GroupMember::built_in("REJECT")];

        let mut reject_group = ProxyGroup::new(reject, "🛑 Reject", ProxyGroupType::Select);
        reject_group.proxies = vec![GroupMember::built_in("REJECT"), GroupMember::built_in("DIRECT")];

        let mut fallback_group = ProxyGroup::new(fallback, "🐟 Fallback", ProxyGroupType::Select);
        fallback_group.proxies = vec![
            GroupMember::group(select, "🚀 Select"),
            GroupMember::group(direct, "🎯 Direct"),
        ];

        let rules = vec![
            Rule::new(RuleType::Logic, "AND,((DST-PORT,443),(NETWORK,udp))", reject),
            Rule::new(RuleType::Geosite, "category-ads-all", reject),
            Rule::new(RuleType::Geoip, "private", direct).no_resolve(),
            Rule::new(RuleType::Geoip, "CN", direct).no_resolve(),
            Rule::new(RuleType::Geosite, "private", direct),
            Rule::new(RuleType::Geosite, "CN", direct),
            Rule::new(RuleType::Geosite, "geolocation-!cn", select),
            Rule::new(RuleType::Match, "", fallback),
        ];

        Self {
            id: new_id(),
            name: name.to_string(),
            general_config: GeneralConfig::default(),
            advanced_config: AdvancedConfig::default(),
            tun_config: TunConfig::default(),
            dns_config: DnsConfig::default(),
            proxy_groups_config: vec![select_group, auto_group, direct_group, reject_group, fallback_group],
            rules_config: rules,
            mixin_config: MixinConfig::default(),
            script_config: ScriptConfig::default(),
        }
    }

    pub fn group_name(&self, id: &str) -> Option<&str> {
        self.proxy_groups_config
            .iter()
            .find(|g| g.id == id)
            .map(|g| g.name.as_str())
    }

    /// Does any group of this profile draw proxies from `subscription_id`?
    pub fn uses_subscription(&self, subscription_id: &str) -> bool {
        self.proxy_groups_config
            .iter()
            .any(|g| g.uses_subscription(subscription_id))
    }

    /// Ruleset IDs (or names) this profile depends on: file RULE-SET rules,
    /// `rule-set:` keys of the DNS nameserver policy and `rule-set:` entries
    /// of the fake-ip filter.
    pub fn referenced_rulesets(&self) -> Vec<String> {
        let dns = &self.dns_config;
        let mut refs: Vec<String> = dns
            .nameserver_policy
            .keys()
            .map(String::as_str)
            .chain(dns.fake_ip_filter.iter().map(String::as_str))
            .filter_map(|k| k.strip_prefix(RULE_SET_MARKER))
            .flat_map(|names| names.split(','))
            .map(|name| name.trim().to_string())
            .collect();
        refs.extend(
            self.rules_config
                .iter()
                .filter(|r| r.rule_type == RuleType::RuleSet && r.ruleset_type == RulesetSourceKind::File)
                .map(|r| r.payload.clone()),
        );
        refs
    }
}

/// Prefix used by DNS settings to point at a rule provider by name.
pub const RULE_SET_MARKER: &str = "rule-set:";

// ---------------------------------------------------------------------------
// HTTP handlers

#[derive(Serialize)]
pub struct ProfileSummary {
    pub id: String,
    pub name: String,
    pub is_active: bool,
}

#[derive(Deserialize)]
pub struct CreateProfileRequest {
    pub name: String,
}

pub async fn list_profiles() -> Json<ApiResponse<Vec<ProfileSummary>>> {
    let state = app_state();
    let active = crate::get_app_settings_snapshot().active_profile_id;

    let profiles = state
        .profiles
        .snapshot()
        .into_iter()
        .map(|p| ProfileSummary {
            is_active: active.as_deref() == Some(p.id.as_str()),
            id: p.id,
            name: p.name,
        })
        .collect();

    Json(ApiResponse::ok(profiles))
}

pub async fn get_profile(Path(id): Path<String>) -> Json<ApiResponse<Profile>> {
    match app_state().profiles.get(&id) {
        Some(profile) => Json(ApiResponse::ok(profile)),
        None => Json(ApiResponse::error("profile_not_found", "profile not found")),
    }
}

pub async fn create_profile(
    Json(body): Json<CreateProfileRequest>,
) -> Json<ApiResponse<Profile>> {
    let state = app_state();
    let profile = Profile::with_defaults(body.name.trim());

    if let Err(err) = state.profiles.add(profile.clone()).await {
        tracing::error!("failed to create profile {}: {err}", profile.name);
        return Json(ApiResponse::error("profile_save_failed", err.to_string()));
    }

    tracing::info!("created profile {} ({})", profile.name, profile.id);
    Json(ApiResponse::ok(profile))
}

pub async fn update_profile(
    Path(id): Path<String>,
    Json(mut body): Json<Profile>,
) -> Json<ApiResponse<Profile>> {
    let state = app_state();
    body.id = id.clone();

    if let Err(err) = state.profiles.edit(&id, body.clone()).await {
        tracing::error!("failed to update profile {id}: {err}");
        return Json(ApiResponse::error("profile_save_failed", err.to_string()));
    }

    crate::kernel::notify_config_change(ConfigChangeReason::ProfileUpdated { id });
    Json(ApiResponse::ok(body))
}

pub async fn delete_profile(Path(id): Path<String>) -> Json<ApiResponse<serde_json::Value>> {
    let state = app_state();

    let settings = crate::get_app_settings_snapshot();
    if settings.active_profile_id.as_deref() == Some(id.as_str()) && state.kernel.is_running() {
        return Json(ApiResponse::error(
            "profile_in_use",
            "the active profile cannot be deleted while the kernel is running",
        ));
    }

    match state.profiles.delete(&id).await {
        Ok(profile) => {
            if settings.active_profile_id.as_deref() == Some(id.as_str()) {
                if let Err(err) = crate::with_app_settings_mut(|s| s.active_profile_id = None) {
                    tracing::error!("failed to clear active profile: {err}");
                }
            }
            tracing::info!("deleted profile {} ({id})", profile.name);
            Json(ApiResponse::ok(serde_json::json!({})))
        }
        Err(err) => Json(ApiResponse::error("profile_delete_failed", err.to_string())),
    }
}

pub async fn activate_profile(Path(id): Path<String>) -> Json<ApiResponse<serde_json::Value>> {
    let state = app_state();
    if state.profiles.get(&id).is_none() {
        return Json(ApiResponse::error("profile_not_found", "profile not found"));
    }

    if let Err(err) = crate::with_app_settings_mut(|s| s.active_profile_id = Some(id.clone())) {
        tracing::error!("failed to persist active profile: {err}");
        return Json(ApiResponse::error("settings_save_failed", err));
    }

    crate::kernel::notify_config_change(ConfigChangeReason::ActiveProfileChanged { id });
    Json(ApiResponse::ok(serde_json::json!({})))
}

/// Runs the whole generation pipeline without writing or starting anything.
pub async fn preview_profile_config(
    Path(id): Path<String>,
) -> Json<ApiResponse<serde_json::Value>> {
    let state = app_state();
    let Some(profile) = state.profiles.get(&id) else {
        return Json(ApiResponse::error("profile_not_found", "profile not found"));
    };

    let ctx = crate::overrides::PipelineContext::from_app(state);
    match crate::overrides::render_config(&profile, &ctx, crate::overrides::Purpose::Preview).await {
        Ok(content) => Json(ApiResponse::ok(serde_json::json!({ "content": content }))),
        Err(err) => {
            tracing::warn!("failed to generate config for profile {}: {err}", profile.name);
            let code = match &err {
                crate::generator::GenerateError::ScriptRuntimeUnavailable(_) => "script_runtime_unavailable",
                _ => "config_generate_failed",
            };
            Json(ApiResponse::error(code, err.to_string()))
        }
    }
}
