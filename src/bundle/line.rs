// src/bundle/line.rs

use crate::bundle::{BundleError, BundleParser, SettingsMap};

/// Line-delimited `KEY=value` bundles (`.txt`, `.env`)
pub struct LineParser;

impl BundleParser for LineParser {
    fn parse(&self, content: &str) -> Result<SettingsMap, BundleError> {
        let mut map = SettingsMap::new();

        for (index, raw) in content.split('\n').enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            let mut parts = line.split('=');
            let (key, value) = match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(value), None) => (key.trim(), value.trim()),
                _ => {
                    return Err(BundleError::Format(format!(
                        "line {} must contain exactly one '='",
                        index + 1
                    )))
                }
            };

            if key.is_empty() {
                return Err(BundleError::Format(format!("line {} has an empty key", index + 1)));
            }

            map.insert(key, value);
        }

        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn blank_lines_and_crlf_are_ignored() {
        let map = LineParser.parse("\nA=1\r\n\n  b = two  \n").unwrap();
        assert_eq!(map.to_env_format(), "A=1\nB=two");
    }

    #[test]
    fn missing_separator_is_a_format_error() {
        let err = LineParser.parse("A=1\nNOT_A_PAIR\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn double_separator_is_a_format_error() {
        assert!(matches!(LineParser.parse("A=b=c"), Err(BundleError::Format(_))));
    }

    #[test]
    fn empty_key_is_a_format_error() {
        assert!(LineParser.parse("=value").is_err());
    }

    #[test]
    fn empty_value_is_allowed() {
        let map = LineParser.parse("DEBUG=").unwrap();
        assert_eq!(map.get("DEBUG"), Some(""));
    }

    proptest! {
        #[test]
        fn rendering_is_deterministic_and_ordered(
            pairs in proptest::collection::vec(("[A-Z][A-Z0-9_]{0,12}", "[a-zA-Z0-9@./:_-]{0,16}"), 1..12)
        ) {
            let content = pairs
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("\n");

            let first = LineParser.parse(&content).unwrap();
            let second = LineParser.parse(&content).unwrap();
            prop_assert_eq!(first.to_env_format(), second.to_env_format());

            // First occurrence fixes the position of a key
            let mut expected_order: Vec<&str> = Vec::new();
            for (k, _) in &pairs {
                if !expected_order.contains(&k.as_str()) {
                    expected_order.push(k.as_str());
                }
            }
            prop_assert_eq!(first.keys().collect::<Vec<_>>(), expected_order);
        }

        #[test]
        fn env_rendering_reparses_to_the_same_map(
            pairs in proptest::collection::vec(("[A-Z][A-Z0-9_]{0,12}", "[a-zA-Z0-9@./:_-]{0,16}"), 1..12)
        ) {
            let map: SettingsMap = pairs.into_iter().collect();
            let reparsed = LineParser.parse(&map.to_env_format()).unwrap();
            prop_assert_eq!(reparsed, map);
        }
    }
}
