//! Knobs that change how scope entries are placed in the graph.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// How an entered scope is placed relative to the cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeMode {
    /// Reuse the cursor's child with the same scope, or append one.
    #[default]
    Tree,
    /// Every scope hangs directly off the head, one level deep.
    Flat,
    /// Every entry gets a fresh node, even when the scope repeats.
    Timeline,
}

impl fmt::Display for ScopeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScopeMode::Tree => "tree",
            ScopeMode::Flat => "flat",
            ScopeMode::Timeline => "timeline",
        })
    }
}

impl FromStr for ScopeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tree" => Ok(ScopeMode::Tree),
            "flat" => Ok(ScopeMode::Flat),
            "timeline" => Ok(ScopeMode::Timeline),
            other => Err(format!("unknown scope mode `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Scopes nested deeper than this are not recorded.
    pub max_depth: u32,
    pub scope_mode: ScopeMode,
    /// Merge a thread's graph into its registry when the thread storage drops.
    pub merge_on_drop: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_depth: u32::MAX,
            scope_mode: ScopeMode::Tree,
            merge_on_drop: true,
        }
    }
}

pub const ENV_MAX_DEPTH: &str = "STACKGRAPH_MAX_DEPTH";
pub const ENV_SCOPE: &str = "STACKGRAPH_SCOPE";
pub const ENV_MERGE_ON_DROP: &str = "STACKGRAPH_MERGE_ON_DROP";

impl Settings {
    /// Defaults overridden by `STACKGRAPH_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Settings::from_env`], reading variables through `lookup`.
    ///
    /// Unparsable values are logged and the default is kept.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();
        if let Some(v) = parsed(&lookup, ENV_MAX_DEPTH, |s| s.trim().parse::<u32>().ok()) {
            settings.max_depth = v;
        }
        if let Some(v) = parsed(&lookup, ENV_SCOPE, |s| s.parse::<ScopeMode>().ok()) {
            settings.scope_mode = v;
        }
        if let Some(v) = parsed(&lookup, ENV_MERGE_ON_DROP, parse_bool) {
            settings.merge_on_drop = v;
        }
        settings
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = lookup(key)?;
    let value = parse(&raw);
    if value.is_none() {
        warn!(var = key, value = %raw, "ignoring unparsable setting");
    }
    value
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        assert_eq!(Settings::from_lookup(lookup(&[])), Settings::default());
    }

    #[test]
    fn variables_override_defaults() {
        let s = Settings::from_lookup(lookup(&[
            (ENV_MAX_DEPTH, "8"),
            (ENV_SCOPE, "Flat"),
            (ENV_MERGE_ON_DROP, "off"),
        ]));
        assert_eq!(s.max_depth, 8);
        assert_eq!(s.scope_mode, ScopeMode::Flat);
        assert!(!s.merge_on_drop);
    }

    #[test]
    fn garbage_keeps_defaults() {
        let s = Settings::from_lookup(lookup(&[
            (ENV_MAX_DEPTH, "deep"),
            (ENV_SCOPE, "spiral"),
            (ENV_MERGE_ON_DROP, "maybe"),
        ]));
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn deserializes_partial_json() {
        let s: Settings = serde_json::from_str(r#"{"scope_mode":"timeline"}"#).unwrap();
        assert_eq!(s.scope_mode, ScopeMode::Timeline);
        assert_eq!(s.max_depth, u32::MAX);
        assert!(s.merge_on_drop);
    }
}
