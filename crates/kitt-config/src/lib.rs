use anyhow::{Context, Result};
use kitt_schemas::CampaignConfig;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

pub mod settings;

pub use settings::ServerSettings;

/// Load a campaign YAML file into the typed config plus its canonical hash.
/// The hash identifies the immutable config blob in the ledger.
pub fn load_campaign_config(path: &Path) -> Result<(CampaignConfig, LoadedConfig)> {
    let s = fs::read_to_string(path).with_context(|| format!("read campaign file: {path:?}"))?;
    let yaml_val: serde_yaml::Value =
        serde_yaml::from_str(&s).with_context(|| format!("parse campaign yaml: {path:?}"))?;
    let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;

    let config: CampaignConfig = serde_json::from_value(json_val.clone())
        .with_context(|| format!("invalid campaign config: {path:?}"))?;

    Ok((config, LoadedConfig::from_value(json_val)))
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

impl LoadedConfig {
    /// Canonicalize (stable key order) and hash an already-parsed value.
    /// The same config always hashes the same, whatever key order it
    /// arrived in.
    pub fn from_value(v: Value) -> Self {
        let canonical = canonicalize_json(&v);

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let hash = hex::encode(hasher.finalize());

        LoadedConfig {
            config_json: v,
            canonical_json: canonical,
            config_hash: hash,
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting compact JSON.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}
