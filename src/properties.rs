//! Property namespace (§4.A)
//!
//! A flat string -> string mapping used to interpolate `{name}` tokens in
//! every templated argument a step carries (paths, mount options, command
//! templates). Expansion is a single pass: `{name}` is replaced by the
//! current value of `name`, and the result is not re-scanned for further
//! `{...}` tokens.

use crate::error::{Error, Result};
use std::collections::HashMap;

/// Canonical property names populated by the sequencer before running any step.
pub mod names {
    pub const USER: &str = "user";
    pub const GROUP: &str = "group";
    pub const UID: &str = "uid";
    pub const GID: &str = "gid";
    pub const JAILBASE: &str = "jailbase";
    pub const JAILPRIV: &str = "jailpriv";
    pub const JAILHOME: &str = "jailhome";
    pub const JAILMOUNT: &str = "jailmount";
    pub const JAILDEV: &str = "jaildev";
    pub const JAILTMP: &str = "jailtmp";
    pub const USERHOME: &str = "userhome";
    pub const WRITEPATH: &str = "writepath";
    pub const DEFAULTS_TEXT: &str = "defaults_text";
    pub const ETC_TEXT: &str = "etc_text";
}

/// The property namespace (§3, §4.A).
#[derive(Debug, Default, Clone)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// `set(name, value)`
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// `get(name)` — returns `None` for an unknown name; callers that need to
    /// fail the step on a miss should use [`Properties::require`].
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|s| s.as_str())
    }

    /// Same as [`Properties::get`] but raises a configuration error on a miss,
    /// matching §4.A: "get of an unknown name raises a configuration error
    /// that is propagated to the sequencer".
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| Error::UnknownProperty(name.to_string()))
    }

    /// `expand(template) -> string`
    ///
    /// Replaces each `{name}` token with `get(name)`. Nested expansion is not
    /// performed: a value that itself contains `{...}` is inserted verbatim.
    pub fn expand(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after_open = &rest[open + 1..];
            match after_open.find('}') {
                Some(close) => {
                    let name = &after_open[..close];
                    let value = self.require(name)?;
                    out.push_str(value);
                    rest = &after_open[close + 1..];
                }
                None => {
                    // No matching close brace: treat the rest literally.
                    out.push('{');
                    out.push_str(after_open);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Iterate `(name, value)` pairs, used by `--print` and by tests.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_names() {
        let mut props = Properties::new();
        props.set("jailbase", "/var/jails");
        props.set("user", "alice");
        assert_eq!(
            props.expand("{jailbase}/{user}/home").unwrap(),
            "/var/jails/alice/home"
        );
    }

    #[test]
    fn unknown_name_is_configuration_error() {
        let props = Properties::new();
        let err = props.expand("{nope}").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn expansion_is_not_nested() {
        let mut props = Properties::new();
        props.set("outer", "{inner}");
        props.set("inner", "should-not-appear");
        // `{inner}` inside the value of `outer` is inserted literally, not re-expanded.
        assert_eq!(props.expand("{outer}").unwrap(), "{inner}");
    }

    #[test]
    fn interpolation_uses_current_value_not_parse_time_value() {
        let mut props = Properties::new();
        props.set("user", "alice");
        let template = "{user}";
        assert_eq!(props.expand(template).unwrap(), "alice");
        props.set("user", "bob");
        assert_eq!(props.expand(template).unwrap(), "bob");
    }

    #[test]
    fn unterminated_brace_is_literal() {
        let props = Properties::new();
        assert_eq!(props.expand("literal {oops").unwrap(), "literal {oops");
    }
}
