//! `${VAR}` interpolation for manifest values

use super::settings::Variables;
use regex::{Captures, Regex};
use std::collections::BTreeSet;
use std::sync::OnceLock;

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:-|-|:\?|\?)([^}]*))?\}")
            .expect("interpolation pattern is valid")
    })
}

/// Substitutes variables and records the ones that were required but unset.
///
/// Supported forms: `${VAR}`, `${VAR:-default}` (unset or empty),
/// `${VAR-default}` (unset only), `${VAR:?message}` and `${VAR?message}`.
/// `$$` escapes a literal dollar sign.
pub struct Interpolator<'a> {
    vars: &'a Variables,
    missing: BTreeSet<String>,
}

impl<'a> Interpolator<'a> {
    pub fn new(vars: &'a Variables) -> Self {
        Self {
            vars,
            missing: BTreeSet::new(),
        }
    }

    /// Interpolate one string
    pub fn interpolate(&mut self, input: &str) -> String {
        let vars = self.vars;
        let missing = &mut self.missing;

        pattern()
            .replace_all(input, |caps: &Captures| {
                let Some(name) = caps.get(1).map(|m| m.as_str()) else {
                    return "$".to_string();
                };
                let op = caps.get(2).map(|m| m.as_str());
                let arg = caps.get(3).map(|m| m.as_str()).unwrap_or_default();

                match op {
                    Some(":-") => vars.get(name).unwrap_or(arg).to_string(),
                    Some("-") => vars.get_raw(name).unwrap_or(arg).to_string(),
                    Some(":?") | Some("?") => {
                        let value = if op == Some(":?") {
                            vars.get(name)
                        } else {
                            vars.get_raw(name)
                        };
                        match value {
                            Some(v) => v.to_string(),
                            None => {
                                if !arg.is_empty() {
                                    tracing::debug!(variable = name, reason = arg, "Required variable unset");
                                }
                                missing.insert(name.to_string());
                                String::new()
                            }
                        }
                    }
                    _ => match vars.get(name) {
                        Some(v) => v.to_string(),
                        None => {
                            missing.insert(name.to_string());
                            String::new()
                        }
                    },
                }
            })
            .into_owned()
    }

    /// Interpolate every string inside a YAML document, keys excluded
    pub fn interpolate_value(&mut self, value: &mut serde_yaml::Value) {
        match value {
            serde_yaml::Value::String(s) => {
                if s.contains('$') {
                    *s = self.interpolate(s);
                }
            }
            serde_yaml::Value::Sequence(items) => {
                for item in items {
                    self.interpolate_value(item);
                }
            }
            serde_yaml::Value::Mapping(map) => {
                for (_, item) in map.iter_mut() {
                    self.interpolate_value(item);
                }
            }
            serde_yaml::Value::Tagged(tagged) => self.interpolate_value(&mut tagged.value),
            _ => {}
        }
    }

    /// Variables referenced without a default that were unset
    pub fn into_missing(self) -> BTreeSet<String> {
        self.missing
    }
}
