//! build.json への `key=value` 上書き
//!
//! - `a.b.c=v` はネストしたオブジェクトを途中に作りながら値を設定する
//! - `<phase>_plugins.<plugin>.<arg>=v` は設定済みプラグインの既存引数だけを変更する
//! - 値 `true` / `false` / `none`（大文字小文字を区別しない）は真偽値・null として扱う

use crate::error::{CoreError, Result};
use serde_json::{Map, Value};

/// `key=value` 形式の文字列を分解
pub fn parse_key_values<S: AsRef<str>>(items: &[S]) -> Result<Vec<(String, String)>> {
    items
        .iter()
        .map(|item| {
            let item = item.as_ref();
            item.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| CoreError::Substitution {
                    key: item.to_string(),
                    reason: "'key=value' の形式ではありません".to_string(),
                })
        })
        .collect()
}

/// 置換を順に適用
pub fn apply_substitutions(mapping: &mut Value, substitutions: &[(String, String)]) -> Result<()> {
    let Some(root) = mapping.as_object_mut() else {
        return Err(CoreError::InvalidConfig(
            "build.json のトップレベルはオブジェクトである必要があります".to_string(),
        ));
    };

    for (key, raw) in substitutions {
        let value = parse_value(raw);
        let parts: Vec<&str> = key.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(CoreError::Substitution {
                key: key.clone(),
                reason: "空の要素を含んでいます".to_string(),
            });
        }

        if parts[0].ends_with("_plugins") {
            apply_plugin_substitution(root, key, &parts, value)?;
        } else {
            set_nested(root, &parts, value);
        }
    }
    Ok(())
}

fn parse_value(raw: &str) -> Value {
    match raw.to_ascii_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "none" => Value::Null,
        _ => Value::String(raw.to_string()),
    }
}

fn set_nested(root: &mut Map<String, Value>, parts: &[&str], value: Value) {
    let (last, path) = match parts.split_last() {
        Some(split) => split,
        None => return,
    };
    let mut current = root;
    for part in path {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry.as_object_mut() {
            Some(map) => map,
            None => return,
        };
    }
    current.insert(last.to_string(), value);
}

fn apply_plugin_substitution(
    root: &mut Map<String, Value>,
    key: &str,
    parts: &[&str],
    value: Value,
) -> Result<()> {
    let [phase_key, plugin, arg] = parts else {
        return Err(CoreError::Substitution {
            key: key.to_string(),
            reason: "プラグインへの置換は <phase>_plugins.<plugin>.<arg> の形式が必要です"
                .to_string(),
        });
    };

    let Some(plugins) = root.get_mut(*phase_key).and_then(Value::as_array_mut) else {
        tracing::warn!("there are no plugins with type '{}'", phase_key);
        return Ok(());
    };

    let mut matching: Vec<&mut Value> = plugins
        .iter_mut()
        .filter(|conf| conf.get("name").and_then(Value::as_str) == Some(*plugin))
        .collect();

    match matching.len() {
        0 => {
            tracing::warn!(
                "there is no configuration for plugin '{}', skipping substitution",
                plugin
            );
            Ok(())
        }
        1 => {
            let args = matching[0].get_mut("args").and_then(Value::as_object_mut);
            match args.and_then(|a| a.get_mut(*arg)) {
                Some(slot) => {
                    tracing::info!(
                        "changing value '{}' of plugin '{}': {} -> {}",
                        arg,
                        plugin,
                        slot,
                        value
                    );
                    *slot = value;
                }
                None => tracing::warn!(
                    "no configuration value '{}' for plugin '{}', skipping",
                    arg,
                    plugin
                ),
            }
            Ok(())
        }
        n => Err(CoreError::Substitution {
            key: key.to_string(),
            reason: format!("プラグイン '{}' が {} 回設定されています", plugin, n),
        }),
    }
}
