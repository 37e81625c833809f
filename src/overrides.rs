use std::path::{Path, PathBuf};

use serde_json::Value as JsonValue;
use serde_yaml::{Mapping, Value};

use crate::app::AppState;
use crate::generator::{compile, Catalog, GenerateError};
use crate::merge::deep_assign;
use crate::plugins::{is_noop_script, Capabilities, PluginRegistry, ScriptCall};
use crate::profiles::{MixinPriority, Profile, DEFAULT_GENERATE_SCRIPT};
use crate::rulesets::Ruleset;
use crate::store::write_atomic;
use crate::subscriptions::Subscription;

pub const CONFIG_HEADER: &str = "# DO NOT EDIT - Generated by corepilot\n";

/// Levels the kernel is allowed to run with; anything else becomes `info`.
const ALLOWED_LOG_LEVELS: [&str; 2] = ["debug", "info"];

/// Why the document is being rendered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Purpose {
    Preview,
    /// Written right before the kernel starts: before-core-start hooks run too.
    KernelStart,
}

/// Everything the pipeline reads besides the profile itself.
pub struct PipelineContext<'a> {
    pub data_root: &'a Path,
    pub subscriptions: Vec<Subscription>,
    pub rulesets: Vec<Ruleset>,
    pub plugins: &'a PluginRegistry,
}

impl<'a> PipelineContext<'a> {
    pub fn from_app(state: &'a AppState) -> Self {
        Self {
            data_root: &state.data_root,
            subscriptions: state.subscriptions.snapshot(),
            rulesets: state.rulesets.snapshot(),
            plugins: &state.plugins,
        }
    }
}

pub fn config_path(data_root: &Path) -> PathBuf {
    data_root.join("kernel").join("config.yaml")
}

/// Parses the mixin text. JSON is a subset of YAML, so both formats go
/// through the YAML parser. Blank text is an empty mapping.
pub fn parse_mixin(text: &str) -> Result<Value, GenerateError> {
    if text.trim().is_empty() {
        return Ok(Value::Mapping(Mapping::new()));
    }
    match serde_yaml::from_str::<Value>(text) {
        Ok(Value::Null) => Ok(Value::Mapping(Mapping::new())),
        Ok(value) => Ok(value),
        Err(err) => Err(GenerateError::Mixin(err.to_string())),
    }
}

/// `mixin`: the mixin overrides the generated keys.
/// `gui`: the generated keys win, the mixin only fills in what is missing.
pub fn apply_mixin(config: &mut Value, mixin: &Value, priority: MixinPriority) {
    match priority {
        MixinPriority::Mixin => deep_assign(config, mixin),
        MixinPriority::Gui => {
            let mut layered = mixin.clone();
            deep_assign(&mut layered, config);
            deep_assign(config, &layered);
        }
    }
}

pub fn clamp_log_level(config: &mut Value) {
    let Value::Mapping(map) = config else {
        return;
    };
    let ok = map
        .get("log-level")
        .and_then(Value::as_str)
        .is_some_and(|level| ALLOWED_LOG_LEVELS.contains(&level));
    if !ok {
        map.insert(Value::from("log-level"), Value::from("info"));
    }
}

async fn run_user_script(
    profile: &Profile,
    config: Value,
    plugins: &PluginRegistry,
) -> Result<Value, GenerateError> {
    let code = &profile.script_config.code;
    if is_noop_script(code, DEFAULT_GENERATE_SCRIPT) {
        return Ok(config);
    }
    if !plugins.runtime().is_available() {
        return Err(GenerateError::ScriptRuntimeUnavailable(profile.name.clone()));
    }

    let arg = serde_json::to_value(&config).map_err(|err| GenerateError::Serialize {
        section: "script input",
        message: err.to_string(),
    })?;
    let call = ScriptCall {
        label: profile.name.clone(),
        source: code.clone(),
        entry: "onGenerate".to_string(),
        args: vec![arg],
        settings: JsonValue::Null,
        capabilities: Capabilities::none(),
    };
    let result = plugins
        .runtime()
        .invoke(call)
        .await
        .map_err(GenerateError::Script)?;
    if !result.is_object() {
        return Err(GenerateError::Script("Wrong result".to_string()));
    }
    serde_yaml::to_value(result).map_err(|err| GenerateError::Script(err.to_string()))
}

/// Runs the whole layered pipeline and returns the file content, header
/// included. Nothing is written.
pub async fn render_config(
    profile: &Profile,
    ctx: &PipelineContext<'_>,
    purpose: Purpose,
) -> Result<String, GenerateError> {
    let catalog = Catalog::load(
        profile,
        ctx.subscriptions.clone(),
        ctx.rulesets.clone(),
        ctx.data_root,
    );
    let mut config = compile(profile, &catalog)?;

    let profile_json = serde_json::to_value(profile).map_err(|err| GenerateError::Serialize {
        section: "profile",
        message: err.to_string(),
    })?;

    config = ctx.plugins.on_generate(config, &profile_json).await?;

    let mixin = parse_mixin(&profile.mixin_config.config)?;
    apply_mixin(&mut config, &mixin, profile.mixin_config.priority);

    config = run_user_script(profile, config, ctx.plugins).await?;

    if purpose == Purpose::KernelStart {
        config = ctx.plugins.before_core_start(config, &profile_json).await?;
    }

    clamp_log_level(&mut config);

    let body = serde_yaml::to_string(&config).map_err(|err| GenerateError::Serialize {
        section: "kernel config",
        message: err.to_string(),
    })?;
    Ok(format!("{CONFIG_HEADER}{body}"))
}

/// Renders for a kernel start and writes `<root>/kernel/config.yaml`.
pub async fn write_config(profile: &Profile, ctx: &PipelineContext<'_>) -> Result<PathBuf, GenerateError> {
    let content = render_config(profile, ctx, Purpose::KernelStart).await?;
    let path = config_path(ctx.data_root);
    write_atomic(&path, content.as_bytes()).map_err(GenerateError::Write)?;
    tracing::info!("wrote kernel config for profile {} to {}", profile.name, path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::tests::{plugin, registry_with, FakeRuntime};
    use crate::plugins::{PluginTrigger, ScriptRuntime, UnavailableRuntime};
    use std::sync::Arc;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn mixin_priority_decides_conflicts() {
        let generated = yaml("x: 1\nnested:\n  a: 1\n");
        let mixin = yaml("x: 2\nnested:\n  b: 2\nextra: true\n");

        let mut config = generated.clone();
        apply_mixin(&mut config, &mixin, MixinPriority::Mixin);
        assert_eq!(config["x"], Value::from(2));
        assert_eq!(config["nested"]["a"], Value::from(1));
        assert_eq!(config["nested"]["b"], Value::from(2));

        let mut config = generated;
        apply_mixin(&mut config, &mixin, MixinPriority::Gui);
        assert_eq!(config["x"], Value::from(1));
        assert_eq!(config["nested"]["b"], Value::from(2));
        assert_eq!(config["extra"], Value::Bool(true));
    }

    #[test]
    fn mixin_json_and_blank_text() {
        assert_eq!(parse_mixin("  \n").unwrap(), Value::Mapping(Mapping::new()));
        let parsed = parse_mixin(r#"{"mode": "global", "ipv6": true}"#).unwrap();
        assert_eq!(parsed["mode"], Value::from("global"));
        assert!(matches!(parse_mixin("a: [1"), Err(GenerateError::Mixin(_))));
    }

    #[test]
    fn log_level_is_clamped() {
        let mut config = yaml("log-level: silent\n");
        clamp_log_level(&mut config);
        assert_eq!(config["log-level"], Value::from("info"));

        let mut config = yaml("log-level: debug\n");
        clamp_log_level(&mut config);
        assert_eq!(config["log-level"], Value::from("debug"));
    }

    #[tokio::test]
    async fn stock_profile_renders_with_header_and_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let runtime: Arc<dyn ScriptRuntime> = Arc::new(UnavailableRuntime);
        let registry = registry_with(dir.path(), Vec::new(), runtime).await;
        let ctx = PipelineContext {
            data_root: dir.path(),
            subscriptions: Vec::new(),
            rulesets: Vec::new(),
            plugins: &registry,
        };

        let mut profile = Profile::with_defaults("Default");
        let content = render_config(&profile, &ctx, Purpose::Preview).await.unwrap();
        assert!(content.starts_with(CONFIG_HEADER));

        profile.script_config.code = "const onGenerate = async (c) => c".to_string();
        let err = render_config(&profile, &ctx, Purpose::Preview).await.unwrap_err();
        assert!(matches!(err, GenerateError::ScriptRuntimeUnavailable(ref name) if *name == "Default"));
        profile.script_config.code = DEFAULT_GENERATE_SCRIPT.to_string();

        let parsed: Value = serde_yaml::from_str(&content).unwrap();
        assert_eq!(parsed["mixed-port"], Value::from(20112));
        assert_eq!(parsed["log-level"], Value::from("info"));
        assert_eq!(parsed["proxy-groups"].as_sequence().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn script_errors_and_results_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(|call: &ScriptCall| {
            if call.source.contains("throw") {
                return Err("boom".to_string());
            }
            if call.source.contains("scalar") {
                return Ok(serde_json::json!(42));
            }
            let mut config = call.args[0].clone();
            config["mode"] = serde_json::json!("global");
            Ok(config)
        }));
        let registry = registry_with(dir.path(), Vec::new(), runtime.clone()).await;
        let ctx = PipelineContext {
            data_root: dir.path(),
            subscriptions: Vec::new(),
            rulesets: Vec::new(),
            plugins: &registry,
        };

        let mut profile = Profile::with_defaults("Scripted");
        render_config(&profile, &ctx, Purpose::Preview).await.unwrap();
        assert!(runtime.calls.lock().unwrap().is_empty(), "stock script must not run");

        profile.script_config.code = "const onGenerate = async (c) => { c.mode = 'global'; return c }".to_string();
        let content = render_config(&profile, &ctx, Purpose::Preview).await.unwrap();
        assert!(content.contains("mode: global"));

        profile.script_config.code = "throw".to_string();
        let err = render_config(&profile, &ctx, Purpose::Preview).await.unwrap_err();
        assert_eq!(err.to_string(), "script error: boom");

        profile.script_config.code = "scalar".to_string();
        let err = render_config(&profile, &ctx, Purpose::Preview).await.unwrap_err();
        assert_eq!(err.to_string(), "script error: Wrong result");
    }

    #[tokio::test]
    async fn before_core_start_hooks_only_run_for_kernel_start() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(|call: &ScriptCall| {
            let mut config = call.args[0].clone();
            config["ipv6"] = serde_json::json!(true);
            Ok(config)
        }));
        let hook = plugin("ipv6", &[PluginTrigger::BeforeCoreStart]);
        let registry = registry_with(dir.path(), vec![hook], runtime.clone()).await;
        let ctx = PipelineContext {
            data_root: dir.path(),
            subscriptions: Vec::new(),
            rulesets: Vec::new(),
            plugins: &registry,
        };
        let profile = Profile::with_defaults("Hooked");

        let preview = render_config(&profile, &ctx, Purpose::Preview).await.unwrap();
        assert!(preview.contains("ipv6: false"));
        assert!(runtime.calls.lock().unwrap().is_empty());

        let path = write_config(&profile, &ctx).await.unwrap();
        assert_eq!(path, dir.path().join("kernel").join("config.yaml"));
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with(CONFIG_HEADER));
        let parsed: Value = serde_yaml::from_str(&written).unwrap();
        assert_eq!(parsed["ipv6"], Value::Bool(true));
        assert_eq!(runtime.calls.lock().unwrap()[0].entry, "onBeforeCoreStart");
    }
}
