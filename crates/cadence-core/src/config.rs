use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CadenceError, Result};
use crate::types::{ConsumerClass, PatternDefinition, Step};

/// Top-level configuration for the Cadence dispatch engine.
///
/// Loaded once at startup from `~/.cadence/config.toml` by default. The
/// engine never re-reads it; live changes go through the engine handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub cooldowns: CooldownConfig,
    #[serde(default = "default_classes")]
    pub classes: BTreeMap<String, ClassConfig>,
    #[serde(default)]
    pub patterns: Vec<PatternDefinition>,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            dispatch: DispatchConfig::default(),
            limits: LimitsConfig::default(),
            cooldowns: CooldownConfig::default(),
            classes: default_classes(),
            patterns: Vec::new(),
        }
    }
}

fn default_classes() -> BTreeMap<String, ClassConfig> {
    let mut classes = BTreeMap::new();
    classes.insert(DEFAULT_CLASS.to_string(), ClassConfig::default());
    classes
}

const DEFAULT_CLASS: &str = "device";

impl CadenceConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed. Semantic checks
    /// are left to [`CadenceConfig::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CadenceConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Look up a class section by (normalized) class name.
    pub fn class(&self, class: &ConsumerClass) -> Option<&ClassConfig> {
        self.classes
            .iter()
            .find(|(name, _)| ConsumerClass::new(name) == *class)
            .map(|(_, config)| config)
    }

    /// All configured consumer classes, normalized.
    pub fn class_names(&self) -> Vec<ConsumerClass> {
        self.classes.keys().map(ConsumerClass::new).collect()
    }

    /// Check cross-references between sections.
    pub fn validate(&self) -> Result<()> {
        if self.classes.is_empty() {
            return Err(CadenceError::Config(
                "at least one consumer class must be configured".to_string(),
            ));
        }

        let known: HashSet<ConsumerClass> = self.class_names().into_iter().collect();
        if known.len() != self.classes.len() {
            return Err(CadenceError::Config(
                "consumer class names must be unique ignoring case".to_string(),
            ));
        }

        let default_class = ConsumerClass::new(&self.dispatch.default_class);
        if !known.contains(&default_class) {
            return Err(CadenceError::Config(format!(
                "default class '{}' is not configured",
                default_class
            )));
        }

        for (kind, class) in &self.dispatch.routes {
            if !known.contains(&ConsumerClass::new(class)) {
                return Err(CadenceError::Config(format!(
                    "route for kind '{}' points at unknown class '{}'",
                    kind, class
                )));
            }
        }

        if self.limits.min_duration_ms > self.limits.max_duration_ms {
            return Err(CadenceError::Config(
                "limits.min_duration_ms exceeds limits.max_duration_ms".to_string(),
            ));
        }
        if self.limits.min_priority > self.limits.max_priority {
            return Err(CadenceError::Config(
                "limits.min_priority exceeds limits.max_priority".to_string(),
            ));
        }

        for (name, class) in &self.classes {
            if class.max_queue_size == 0 {
                return Err(CadenceError::Config(format!(
                    "class '{}' must allow at least one queued item",
                    name
                )));
            }
        }

        let mut pattern_ids = HashSet::new();
        for pattern in &self.patterns {
            let id = pattern.id.trim().to_lowercase();
            if id.is_empty() {
                return Err(CadenceError::Config("pattern id must not be empty".to_string()));
            }
            if !pattern_ids.insert(id) {
                return Err(CadenceError::Config(format!(
                    "duplicate pattern id '{}'",
                    pattern.id
                )));
            }
            if pattern.steps.is_empty() {
                return Err(CadenceError::Config(format!(
                    "pattern '{}' has no steps",
                    pattern.id
                )));
            }
            for step in &pattern.steps {
                if let Step::Action(template) = step {
                    if template.kind.trim().is_empty() {
                        return Err(CadenceError::Config(format!(
                            "pattern '{}' has an action step without a kind",
                            pattern.id
                        )));
                    }
                    if let Some(class) = &template.class {
                        if !known.contains(&ConsumerClass::new(class)) {
                            return Err(CadenceError::Config(format!(
                                "pattern '{}' references unknown class '{}'",
                                pattern.id, class
                            )));
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Engine-wide dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Added to an action's duration before the loop may move on.
    pub safety_margin_ms: u64,
    /// Class used when neither the action nor a route names one.
    pub default_class: String,
    /// Upper bound for a pattern's repeat count.
    pub max_repeat_count: u32,
    /// Window for duplicate suppression by dedupe key. 0 disables it.
    pub dedupe_ttl_ms: u64,
    /// Number of finished executions kept for status queries.
    pub execution_history: usize,
    /// Action kind to consumer class.
    pub routes: BTreeMap<String, String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            safety_margin_ms: 200,
            default_class: DEFAULT_CLASS.to_string(),
            max_repeat_count: 100,
            dedupe_ttl_ms: 0,
            execution_history: 256,
            routes: BTreeMap::new(),
        }
    }
}

impl DispatchConfig {
    /// Resolve the routed class for an action kind, ignoring case.
    pub fn route(&self, kind: &str) -> Option<ConsumerClass> {
        self.routes
            .iter()
            .find(|(k, _)| k.trim().eq_ignore_ascii_case(kind.trim()))
            .map(|(_, class)| ConsumerClass::new(class))
    }
}

/// Safety bounds applied to every admitted action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub max_intensity: u32,
    pub min_priority: i32,
    pub max_priority: i32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_duration_ms: 0,
            max_duration_ms: 60_000,
            max_intensity: 100,
            min_priority: -100,
            max_priority: 100,
        }
    }
}

/// Minimum intervals between dispatches sharing a scope key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    pub global_ms: u64,
    pub per_target_ms: u64,
    pub per_user_ms: u64,
    /// Per action kind overrides.
    pub kinds: BTreeMap<String, CooldownOverride>,
}

/// Partial override of the cooldown intervals for one action kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownOverride {
    pub global_ms: Option<u64>,
    pub per_target_ms: Option<u64>,
    pub per_user_ms: Option<u64>,
}

/// Effective cooldown intervals for one action kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CooldownIntervals {
    pub global_ms: u64,
    pub per_target_ms: u64,
    pub per_user_ms: u64,
}

impl CooldownConfig {
    /// Resolve the intervals for `kind`, applying any matching override.
    pub fn intervals_for(&self, kind: &str) -> CooldownIntervals {
        let base = CooldownIntervals {
            global_ms: self.global_ms,
            per_target_ms: self.per_target_ms,
            per_user_ms: self.per_user_ms,
        };
        match self
            .kinds
            .iter()
            .find(|(k, _)| k.trim().eq_ignore_ascii_case(kind.trim()))
        {
            Some((_, o)) => CooldownIntervals {
                global_ms: o.global_ms.unwrap_or(base.global_ms),
                per_target_ms: o.per_target_ms.unwrap_or(base.per_target_ms),
                per_user_ms: o.per_user_ms.unwrap_or(base.per_user_ms),
            },
            None => base,
        }
    }
}

/// How the host delivers actions for a class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    /// Log the dispatch and confirm once the action's duration has elapsed.
    #[default]
    Log,
    /// Emit a dispatch instruction on stdout and wait for a reported completion.
    Stdout,
}

/// Safety timeout strategy for a class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum TimeoutConfig {
    /// The action's own duration plus the safety margin.
    #[default]
    Fixed,
    /// Sum of every phase plus a fixed buffer.
    MultiPhase {
        #[serde(default)]
        phases_ms: Vec<u64>,
        #[serde(default = "default_phase_buffer_ms")]
        buffer_ms: u64,
    },
}

fn default_phase_buffer_ms() -> u64 {
    10_000
}

/// Per consumer class settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassConfig {
    /// Lower bound on the time between two dispatches of the class.
    pub min_processing_delay_ms: u64,
    pub max_queue_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// 0 disables the rate limit.
    pub max_dispatches_per_minute: u32,
    pub sender: SenderKind,
    pub timeout: TimeoutConfig,
}

impl Default for ClassConfig {
    fn default() -> Self {
        Self {
            min_processing_delay_ms: 0,
            max_queue_size: 1000,
            max_retries: 3,
            retry_delay_ms: 1000,
            max_dispatches_per_minute: 0,
            sender: SenderKind::Log,
            timeout: TimeoutConfig::Fixed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionTemplate;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = CadenceConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.dispatch.safety_margin_ms, 200);
        assert_eq!(config.dispatch.default_class, "device");
        assert_eq!(config.dispatch.max_repeat_count, 100);
        assert_eq!(config.limits.max_duration_ms, 60_000);
        assert_eq!(config.classes.len(), 1);

        let device = &config.classes["device"];
        assert_eq!(device.max_queue_size, 1000);
        assert_eq!(device.max_retries, 3);
        assert_eq!(device.retry_delay_ms, 1000);
        assert_eq!(device.timeout, TimeoutConfig::Fixed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_valid_config() {
        let content = r#"
[general]
log_level = "debug"

[dispatch]
safety_margin_ms = 150
default_class = "device"

[dispatch.routes]
alert = "overlay"

[cooldowns]
global_ms = 500
per_user_ms = 15000

[cooldowns.kinds.alert]
per_user_ms = 0

[classes.device]
max_retries = 5

[classes.overlay]
sender = "stdout"
min_processing_delay_ms = 250

[classes.overlay.timeout]
strategy = "multi_phase"
phases_ms = [1200, 15000, 250]

[[patterns]]
id = "pulse"
name = "Pulse"
steps = [
    { type = "action", kind = "vibrate", duration_ms = 1000, intensity = 50 },
    { type = "pause", duration_ms = 500 },
]
"#;
        let file = create_temp_config(content);
        let config = CadenceConfig::load(file.path()).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.dispatch.safety_margin_ms, 150);
        assert_eq!(config.dispatch.route("ALERT"), Some(ConsumerClass::new("overlay")));
        assert_eq!(config.classes["device"].max_retries, 5);

        let overlay = config.class(&ConsumerClass::new("Overlay")).unwrap();
        assert_eq!(overlay.sender, SenderKind::Stdout);
        assert_eq!(overlay.min_processing_delay_ms, 250);
        assert_eq!(
            overlay.timeout,
            TimeoutConfig::MultiPhase {
                phases_ms: vec![1200, 15000, 250],
                buffer_ms: 10_000,
            }
        );

        assert_eq!(config.patterns.len(), 1);
        assert_eq!(config.patterns[0].steps.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let content = r#"
[general]
log_level = "warn"
"#;
        let file = create_temp_config(content);
        let config = CadenceConfig::load(file.path()).unwrap();
        assert_eq!(config.general.log_level, "warn");
        assert_eq!(config.dispatch.safety_margin_ms, 200);
        assert!(config.classes.contains_key("device"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = CadenceConfig::load_or_default(Path::new("/nonexistent/config.toml"));
        assert_eq!(config.dispatch.default_class, "device");
    }

    #[test]
    fn test_load_invalid_toml_is_config_error() {
        let file = create_temp_config("[dispatch\nsafety_margin_ms = ");
        let err = CadenceConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, CadenceError::Config(_)));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = CadenceConfig::default();
        config.patterns.push(PatternDefinition::new(
            "double",
            vec![
                Step::Action(ActionTemplate::new("tap", 100)),
                Step::Pause { duration_ms: 50 },
            ],
        ));
        config.save(&path).unwrap();

        let reloaded = CadenceConfig::load(&path).unwrap();
        assert_eq!(reloaded.dispatch.safety_margin_ms, config.dispatch.safety_margin_ms);
        assert_eq!(reloaded.patterns, config.patterns);
        assert_eq!(reloaded.classes.len(), 1);
    }

    #[test]
    fn test_cooldown_override_by_kind() {
        let mut cooldowns = CooldownConfig {
            global_ms: 100,
            per_target_ms: 200,
            per_user_ms: 300,
            kinds: BTreeMap::new(),
        };
        cooldowns.kinds.insert(
            "Zap".to_string(),
            CooldownOverride {
                per_user_ms: Some(5_000),
                ..CooldownOverride::default()
            },
        );

        let zap = cooldowns.intervals_for("zap");
        assert_eq!(zap.global_ms, 100);
        assert_eq!(zap.per_target_ms, 200);
        assert_eq!(zap.per_user_ms, 5_000);

        let other = cooldowns.intervals_for("beep");
        assert_eq!(other.per_user_ms, 300);
    }

    #[test]
    fn test_validate_rejects_unknown_default_class() {
        let mut config = CadenceConfig::default();
        config.dispatch.default_class = "overlay".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("default class 'overlay'"));
    }

    #[test]
    fn test_validate_rejects_route_to_unknown_class() {
        let mut config = CadenceConfig::default();
        config
            .dispatch
            .routes
            .insert("alert".to_string(), "nowhere".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_pattern() {
        let mut config = CadenceConfig::default();
        config.patterns.push(PatternDefinition::new("empty", vec![]));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("has no steps"));
    }

    #[test]
    fn test_validate_rejects_duplicate_pattern_ids() {
        let mut config = CadenceConfig::default();
        let steps = vec![Step::Pause { duration_ms: 10 }];
        config.patterns.push(PatternDefinition::new("Wave", steps.clone()));
        config.patterns.push(PatternDefinition::new("wave", steps));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate pattern id"));
    }

    #[test]
    fn test_validate_rejects_inverted_limits() {
        let mut config = CadenceConfig::default();
        config.limits.min_priority = 10;
        config.limits.max_priority = -10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = CadenceConfig::default();
        config.classes.get_mut("device").unwrap().max_queue_size = 0;
        assert!(config.validate().is_err());
    }
}
