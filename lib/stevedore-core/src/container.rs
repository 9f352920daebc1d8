//! Container identity and the eligibility filters from the Pump
//! Supervisor's event handling.

use std::collections::HashMap;

/// A snapshot of the container-runtime-reported identity and config of
/// one container, as needed by the matcher and the eligibility
/// filters. Cheap to clone; pumps and routes only ever hold a
/// snapshot, never a live handle into the runtime client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Full container id, as reported by the runtime.
    pub id: String,
    /// Display name, including any leading `/` the runtime adds.
    pub name: String,
    /// `KEY=VALUE` environment entries.
    pub env: Vec<String>,
    /// Container labels.
    pub labels: HashMap<String, String>,
    /// Whether the container was created with a TTY attached.
    pub tty: bool,
    /// The runtime's log driver, e.g. `json-file`.
    pub log_driver: String,
    /// Whether the runtime currently reports the container as running.
    pub running: bool,
}

/// Log drivers the runtime exposes a tail API for. Containers using
/// any other driver (`none`, external logging plugins, etc.) cannot be
/// followed and are skipped during eligibility filtering.
pub const TAILABLE_LOG_DRIVERS: &[&str] = &["json-file", "journald", "local"];

impl ContainerInfo {
    /// The id truncated to the 12-hex-character short form used
    /// throughout the engine (matching, route ids, log output).
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    /// The display name with any leading `/` stripped.
    pub fn normal_name(&self) -> &str {
        normal_name(&self.name)
    }

    /// `true` if an environment entry reads `LOGSPOUT=ignore`
    /// (case-insensitive on the value).
    pub fn has_ignore_env(&self) -> bool {
        self.env.iter().any(|entry| match entry.split_once('=') {
            Some((key, value)) => {
                key.eq_ignore_ascii_case("LOGSPOUT") && value.eq_ignore_ascii_case("ignore")
            }
            None => false,
        })
    }

    /// `true` if the runtime exposes a tail API for this container's
    /// log driver.
    pub fn has_tailable_driver(&self) -> bool {
        TAILABLE_LOG_DRIVERS
            .iter()
            .any(|driver| driver.eq_ignore_ascii_case(&self.log_driver))
    }
}

/// Truncates a container id to its 12-hex-character short form.
/// Ids shorter than 12 characters (as can happen with test fixtures)
/// are returned unchanged.
pub fn short_id(id: &str) -> &str {
    if id.len() > 12 {
        &id[..12]
    } else {
        id
    }
}

/// Strips a single leading `/` from a container name, as the runtime
/// always prefixes display names with one.
pub fn normal_name(name: &str) -> &str {
    name.strip_prefix('/').unwrap_or(name)
}

/// An operator-configured container exclusion rule, parsed from
/// `EXCLUDE_LABEL`/`EXCLUDE_LABELS`. Syntax: `key:value` pairs,
/// semicolon-separated; a bare `key` defaults its value to `"true"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionLabel {
    pub key: String,
    pub value: String,
}

impl ExclusionLabel {
    /// Parses the `EXCLUDE_LABEL`/`EXCLUDE_LABELS` environment syntax.
    pub fn parse_all(spec: &str) -> Vec<ExclusionLabel> {
        spec.split(';')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.split_once(':') {
                Some((key, value)) => ExclusionLabel {
                    key: key.to_string(),
                    value: value.to_string(),
                },
                None => ExclusionLabel {
                    key: entry.to_string(),
                    value: "true".to_string(),
                },
            })
            .collect()
    }

    /// `true` if this container carries a label matching this exclusion rule.
    pub fn matches(&self, container: &ContainerInfo) -> bool {
        container
            .labels
            .get(&self.key)
            .is_some_and(|value| value == &self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ContainerInfo {
        ContainerInfo {
            id: "abcdef0123456789".to_string(),
            name: "/web-1".to_string(),
            env: vec!["FOO=bar".to_string()],
            labels: HashMap::new(),
            tty: false,
            log_driver: "json-file".to_string(),
            running: true,
        }
    }

    #[test]
    fn short_id_truncates_to_twelve() {
        assert_eq!(info().short_id(), "abcdef012345");
    }

    #[test]
    fn short_id_leaves_short_ids_alone() {
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn normal_name_strips_leading_slash() {
        assert_eq!(info().normal_name(), "web-1");
    }

    #[test]
    fn ignore_env_is_case_insensitive() {
        let mut c = info();
        c.env = vec!["logspout=IGNORE".to_string()];
        assert!(c.has_ignore_env());
    }

    #[test]
    fn ignore_env_requires_exact_key() {
        let mut c = info();
        c.env = vec!["MY_LOGSPOUT=ignore".to_string()];
        assert!(!c.has_ignore_env());
    }

    #[test]
    fn exclusion_label_defaults_value_to_true() {
        let rules = ExclusionLabel::parse_all("com.example.exclude");
        assert_eq!(rules[0].value, "true");
    }

    #[test]
    fn exclusion_label_parses_multiple() {
        let rules = ExclusionLabel::parse_all("a:1; b:2 ;c");
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[1], ExclusionLabel { key: "b".into(), value: "2".into() });
        assert_eq!(rules[2].value, "true");
    }

    #[test]
    fn tailable_driver_allow_list() {
        let mut c = info();
        c.log_driver = "none".to_string();
        assert!(!c.has_tailable_driver());
        c.log_driver = "JSON-File".to_string();
        assert!(c.has_tailable_driver());
    }
}
