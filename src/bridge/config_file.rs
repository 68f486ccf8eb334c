//! Merge of the `oauthAccount` field into Claude Code's JSON config

use std::path::Path;

use serde_json::{json, Map, Value};

use crate::storage::write_file_atomic;

/// Existing config as an object; missing, unreadable or non-object files
/// start from `{}`
pub fn read_config(path: &Path) -> Map<String, Value> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Map::new(),
        Err(err) => {
            tracing::warn!("Failed to read {}: {}", path.display(), err);
            return Map::new();
        }
    };

    match serde_json::from_slice::<Value>(&raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            tracing::warn!("{} is not a JSON object, replacing it", path.display());
            Map::new()
        }
        Err(err) => {
            tracing::warn!("{} is not valid JSON ({}), replacing it", path.display(), err);
            Map::new()
        }
    }
}

pub fn set_oauth_account(config: &mut Map<String, Value>, org_id: &str, org_name: &str) {
    config.insert(
        "oauthAccount".to_string(),
        json!({
            "organizationUuid": org_id,
            "displayName": org_name,
        }),
    );
}

/// Read, set `oauthAccount`, write back pretty-printed with sorted keys
pub fn merge_oauth_account(path: &Path, org_id: &str, org_name: &str) -> std::io::Result<()> {
    let mut config = read_config(path);
    set_oauth_account(&mut config, org_id, org_name);

    // serde_json::Map is a BTreeMap here, so keys serialize sorted
    let mut data = serde_json::to_vec_pretty(&Value::Object(config))?;
    data.push(b'\n');
    write_file_atomic(path, &data)
}
