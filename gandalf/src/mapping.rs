// Jackson Coxson
// Loads the declarative tunnel mapping file

use std::{collections::HashMap, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::GandalfError;

/// One `(local_port, device_port)` pair declared for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Forwarding {
    pub local_port: u16,
    pub device_port: u16,
}

/// All forwardings declared for one device UDID.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelRule {
    pub udid: String,
    #[serde(default)]
    pub name: Option<String>,
    pub forwarding: Vec<Forwarding>,
}

/// The mapping file parsed into an index keyed by UDID. Rebuilt from
/// scratch on every load and swapped in whole.
pub type MappingIndex = HashMap<String, TunnelRule>;

/// Reads and parses a mapping file. Lines whose left-trimmed form starts
/// with `#` are comments.
pub fn load(path: &Path) -> Result<MappingIndex, GandalfError> {
    let contents = fs::read_to_string(path)
        .map_err(|e| GandalfError::MappingFile(format!("can't read {}: {e}", path.display())))?;
    parse(&contents)
}

pub fn parse(contents: &str) -> Result<MappingIndex, GandalfError> {
    let stripped = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .collect::<Vec<&str>>()
        .join("\n");
    if stripped.trim().is_empty() {
        return Ok(MappingIndex::new());
    }

    let value: serde_json::Value = serde_json::from_str(&stripped)
        .map_err(|e| GandalfError::MappingFile(format!("invalid JSON: {e}")))?;
    let entries = match value {
        serde_json::Value::Array(entries) => entries,
        other => {
            return Err(GandalfError::MappingFile(format!(
                "top level must be an array of tunnel entries, got: {}",
                pretty(&other)
            )));
        }
    };

    let mut index = MappingIndex::new();
    for entry in entries {
        let rule: TunnelRule = serde_json::from_value(entry.clone()).map_err(|e| {
            GandalfError::MappingFile(format!("bad tunnel entry ({e}): {}", pretty(&entry)))
        })?;
        if rule.forwarding.is_empty() {
            return Err(GandalfError::MappingFile(format!(
                "field `forwarding` must not be empty: {}",
                pretty(&entry)
            )));
        }
        if rule
            .forwarding
            .iter()
            .any(|f| f.local_port == 0 || f.device_port == 0)
        {
            return Err(GandalfError::MappingFile(format!(
                "ports must be in 1..=65535: {}",
                pretty(&entry)
            )));
        }
        // A UDID declared twice keeps only the later entry.
        index.insert(rule.udid.clone(), rule);
    }
    Ok(index)
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_documented_example() {
        let index = parse(
            r#"
# comment
[{"udid":"9cdfaceca", "name":"i11",
  "forwarding":[{"local_port":2000,"device_port":22},
                {"local_port":3000,"device_port":1122}]}]
"#,
        )
        .unwrap();

        let rule = index.get("9cdfaceca").unwrap();
        assert_eq!(rule.name.as_deref(), Some("i11"));
        assert_eq!(rule.forwarding.len(), 2);
        assert_eq!(rule.forwarding[0].local_port, 2000);
        assert_eq!(rule.forwarding[1].device_port, 1122);
    }

    #[test]
    fn comments_and_blanks_parse_to_an_empty_index() {
        let index = parse("# one\n\n   # two\n").unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn missing_forwarding_names_the_field() {
        let err = parse(r#"[{"udid":"AAA"}]"#).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("forwarding"), "got: {msg}");
        assert!(msg.contains("AAA"), "got: {msg}");
    }

    #[test]
    fn empty_forwarding_list_is_rejected() {
        let err = parse(r#"[{"udid":"AAA","forwarding":[]}]"#).unwrap_err();
        assert!(err.to_string().contains("forwarding"));
    }

    #[test]
    fn zero_port_is_rejected() {
        let err =
            parse(r#"[{"udid":"AAA","forwarding":[{"local_port":0,"device_port":22}]}]"#)
                .unwrap_err();
        assert!(err.to_string().contains("65535"));
    }

    #[test]
    fn top_level_object_is_rejected() {
        let err = parse(r#"{"udid":"AAA"}"#).unwrap_err();
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn later_duplicate_udid_wins() {
        let index = parse(
            r#"[
  {"udid":"AAA","forwarding":[{"local_port":2000,"device_port":22}]},
  {"udid":"AAA","forwarding":[{"local_port":3000,"device_port":23}]}
]"#,
        )
        .unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("AAA").unwrap().forwarding[0].local_port, 3000);
    }

    #[test]
    fn invalid_json_reports_the_parser_message() {
        let err = parse("[{").unwrap_err();
        assert!(err.to_string().contains("invalid JSON"));
    }
}
