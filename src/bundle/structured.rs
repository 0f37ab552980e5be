// src/bundle/structured.rs

use serde_json::Value;

use crate::bundle::{BundleError, BundleParser, SettingsMap};

/// JSON bundles (`.json`)
pub struct JsonParser;

/// YAML bundles (`.yaml`, `.yml`)
pub struct YamlParser;

impl BundleParser for JsonParser {
    fn parse(&self, content: &str) -> Result<SettingsMap, BundleError> {
        let value: Value = serde_json::from_str(content)
            .map_err(|e| BundleError::Format(format!("invalid JSON: {}", e)))?;
        flatten(value)
    }
}

impl BundleParser for YamlParser {
    fn parse(&self, content: &str) -> Result<SettingsMap, BundleError> {
        let value: serde_yaml::Value = serde_yaml::from_str(content)
            .map_err(|e| BundleError::Format(format!("invalid YAML: {}", e)))?;
        // Mapping order survives the conversion (serde_json preserve_order)
        let value = serde_json::to_value(value)
            .map_err(|e| BundleError::Format(format!("unsupported YAML structure: {}", e)))?;
        flatten(value)
    }
}

/// Flattens a document that is either flat or grouped one level deep by section.
fn flatten(value: Value) -> Result<SettingsMap, BundleError> {
    let root = match value {
        Value::Object(root) => root,
        other => {
            return Err(BundleError::Format(format!(
                "top level must be an object, found {}",
                kind(&other)
            )))
        }
    };

    let mut map = SettingsMap::new();
    for (key, value) in root {
        match value {
            Value::Object(section) => {
                for (name, value) in section {
                    let scalar = scalar(&format!("{}.{}", key, name), value)?;
                    insert_checked(&mut map, &name, scalar)?;
                }
            }
            value => {
                let scalar = scalar(&key, value)?;
                insert_checked(&mut map, &key, scalar)?;
            }
        }
    }

    Ok(map)
}

fn insert_checked(map: &mut SettingsMap, name: &str, value: String) -> Result<(), BundleError> {
    if name.trim().is_empty() {
        return Err(BundleError::Format("empty variable name".to_string()));
    }
    map.insert(name, value);
    Ok(())
}

fn scalar(path: &str, value: Value) -> Result<String, BundleError> {
    let text = match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => {
            return Err(BundleError::Format(format!(
                "{} must be a scalar, found {}",
                path,
                kind(&other)
            )))
        }
    };

    // Values end up as KEY=value lines
    if text.contains('\n') || text.contains('\r') {
        return Err(BundleError::Format(format!("{} spans multiple lines", path)));
    }

    Ok(text)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_json_keeps_document_order() {
        let map = JsonParser
            .parse(r#"{"secret_key": "x", "DEBUG": false, "workers": 4}"#)
            .unwrap();

        assert_eq!(map.to_env_format(), "SECRET_KEY=x\nDEBUG=false\nWORKERS=4");
    }

    #[test]
    fn sectioned_json_is_flattened() {
        let map = JsonParser
            .parse(r#"{"DB": {"DATABASE_NAME": "d", "DATABASE_USER": "u"}, "SECRET_KEY": "x"}"#)
            .unwrap();

        assert_eq!(map.get("DATABASE_USER"), Some("u"));
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["DATABASE_NAME", "DATABASE_USER", "SECRET_KEY"]);
    }

    #[test]
    fn malformed_json_is_a_format_error() {
        assert!(matches!(JsonParser.parse("{\"a\": "), Err(BundleError::Format(_))));
        assert!(matches!(JsonParser.parse("[1, 2]"), Err(BundleError::Format(_))));
    }

    #[test]
    fn arrays_and_deep_nesting_are_rejected() {
        assert!(JsonParser.parse(r#"{"HOSTS": ["a", "b"]}"#).is_err());
        assert!(JsonParser.parse(r#"{"DB": {"INNER": {"X": "1"}}}"#).is_err());
    }

    #[test]
    fn multiline_values_are_rejected() {
        let err = JsonParser.parse(r#"{"KEY": "a\nb"}"#).unwrap_err();
        assert!(err.to_string().contains("multiple lines"));
    }

    #[test]
    fn yaml_bundles_parse_like_json() {
        let map = YamlParser
            .parse("SETTINGS:\n  DJANGO_SETTINGS_MODULE: app.settings\n  SECRET_KEY: x\nDEBUG: true\n")
            .unwrap();

        assert_eq!(map.to_env_format(), "DJANGO_SETTINGS_MODULE=app.settings\nSECRET_KEY=x\nDEBUG=true");
    }
}
