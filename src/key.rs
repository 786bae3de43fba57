//! Canonical recipe naming.
//!
//! A recipe is identified by `namespace.name@version{opt=val,...}`. The
//! canonical string is the primary key for memoisation and for the content
//! cache; two recipes are the same instance iff their canonical strings are
//! byte-equal. Options are folded into the key sorted by option name, so
//! `tool{variant=a}` and `tool{variant=b}` are distinct instances.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::ScriptError;

/// A recipe option value. Serialised deterministically into the canonical
/// string, so equal values always produce equal keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::Int(i) => write!(f, "{i}"),
            OptionValue::Str(s) => f.write_str(s),
        }
    }
}

/// Fully-qualified recipe identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecipeKey {
    pub namespace: String,
    pub name: String,
    pub version: String,
    pub options: BTreeMap<String, OptionValue>,
}

impl RecipeKey {
    pub fn new(namespace: &str, name: &str, version: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_options(mut self, options: BTreeMap<String, OptionValue>) -> Self {
        self.options = options;
        self
    }

    /// `namespace.name@version` without options.
    pub fn identity(&self) -> String {
        format!("{}.{}@{}", self.namespace, self.name, self.version)
    }

    /// The full canonical string, options folded in sorted by key.
    pub fn canonical(&self) -> String {
        if self.options.is_empty() {
            return self.identity();
        }
        let opts: Vec<String> = self
            .options
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!("{}{{{}}}", self.identity(), opts.join(","))
    }

    /// Content-cache key: stable digest of the canonical string.
    pub fn hash(&self) -> String {
        blake3::hash(self.canonical().as_bytes()).to_hex().to_string()
    }

    /// Parse a canonical identity string back into its components.
    pub fn parse(text: &str) -> Result<RecipeKey, ScriptError> {
        let bad = |reason: &str| ScriptError::BadIdentity {
            text: text.to_string(),
            reason: reason.to_string(),
        };

        let (head, opts_part) = match text.find('{') {
            Some(brace) => {
                if !text.ends_with('}') {
                    return Err(bad("unterminated option block"));
                }
                (&text[..brace], Some(&text[brace + 1..text.len() - 1]))
            }
            None => (text, None),
        };

        let mut at_parts = head.split('@');
        let ns_name = at_parts.next().unwrap_or_default();
        let version = at_parts.next().ok_or_else(|| bad("missing '@version'"))?;
        if at_parts.next().is_some() {
            return Err(bad("more than one '@'"));
        }

        let mut dot_parts = ns_name.split('.');
        let namespace = dot_parts.next().unwrap_or_default();
        let name = dot_parts.next().ok_or_else(|| bad("missing '.' between namespace and name"))?;
        if dot_parts.next().is_some() {
            return Err(bad("more than one '.' before '@'"));
        }
        if namespace.is_empty() || name.is_empty() || version.is_empty() {
            return Err(bad("namespace, name and version must be non-empty"));
        }

        let mut options = BTreeMap::new();
        if let Some(opts) = opts_part {
            if opts.is_empty() {
                return Err(bad("empty option block"));
            }
            for pair in opts.split(',') {
                let (k, v) = pair
                    .split_once('=')
                    .ok_or_else(|| bad("option without '='"))?;
                if k.is_empty() {
                    return Err(bad("empty option key"));
                }
                options.insert(k.to_string(), parse_option_value(v));
            }
        }

        Ok(RecipeKey {
            namespace: namespace.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            options,
        })
    }
}

/// Option values round-trip through their canonical rendering.
fn parse_option_value(v: &str) -> OptionValue {
    match v {
        "true" => OptionValue::Bool(true),
        "false" => OptionValue::Bool(false),
        _ => match v.parse::<i64>() {
            Ok(i) => OptionValue::Int(i),
            Err(_) => OptionValue::Str(v.to_string()),
        },
    }
}

impl fmt::Display for RecipeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// A fuzzy query against the graph, matched as written.
///
/// - canonical form: byte-equal canonical match
/// - `ns.name@version`: any options
/// - `ns.name`: any version
/// - bare `name`: any namespace, version
/// - anything else matches nothing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Canonical(String),
    Identity { namespace: String, name: String, version: String },
    NsName { namespace: String, name: String },
    Bare(String),
    Never,
}

impl Query {
    pub fn parse(text: &str) -> Query {
        if text.is_empty() {
            return Query::Never;
        }
        if text.contains('{') {
            return match RecipeKey::parse(text) {
                Ok(key) => Query::Canonical(key.canonical()),
                Err(_) => Query::Never,
            };
        }
        match (text.find('.'), text.find('@')) {
            (Some(_), Some(_)) => match RecipeKey::parse(text) {
                Ok(key) => Query::Identity {
                    namespace: key.namespace,
                    name: key.name,
                    version: key.version,
                },
                Err(_) => Query::Never,
            },
            (Some(dot), None) => {
                let (ns, name) = text.split_at(dot);
                let name = &name[1..];
                if ns.is_empty() || name.is_empty() || name.contains('.') {
                    Query::Never
                } else {
                    Query::NsName {
                        namespace: ns.to_string(),
                        name: name.to_string(),
                    }
                }
            }
            (None, Some(_)) => Query::Never,
            (None, None) => Query::Bare(text.to_string()),
        }
    }

    pub fn matches(&self, key: &RecipeKey) -> bool {
        match self {
            Query::Canonical(canon) => key.canonical() == *canon,
            Query::Identity {
                namespace,
                name,
                version,
            } => key.namespace == *namespace && key.name == *name && key.version == *version,
            Query::NsName { namespace, name } => {
                key.namespace == *namespace && key.name == *name
            }
            Query::Bare(name) => key.name == *name,
            Query::Never => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> RecipeKey {
        RecipeKey::parse(s).unwrap()
    }

    #[test]
    fn canonical_round_trips() {
        for text in [
            "local.python@r4",
            "local.python@r4{version=3.14}",
            "vendor.tool@v1{debug=true,jobs=8,variant=x}",
        ] {
            let parsed = key(text);
            assert_eq!(parsed.canonical(), text);
            let reparsed = RecipeKey::parse(&parsed.canonical()).unwrap();
            assert_eq!(parsed, reparsed);
        }
    }

    #[test]
    fn options_sort_by_key() {
        let mut options = BTreeMap::new();
        options.insert("zeta".to_string(), OptionValue::Int(1));
        options.insert("alpha".to_string(), OptionValue::Str("x".to_string()));
        let k = RecipeKey::new("local", "tool", "v1").with_options(options);
        assert_eq!(k.canonical(), "local.tool@v1{alpha=x,zeta=1}");
    }

    #[test]
    fn rejects_malformed_identities() {
        for text in ["python", "local.python", "a.b.c@v1", "a@v1", "a.b@v1@v2", ".b@v1", "a.@v1", "a.b@"] {
            assert!(RecipeKey::parse(text).is_err(), "{text} should not parse");
        }
    }

    #[test]
    fn hash_is_stable_and_distinct() {
        let a = key("local.tool@v1");
        let b = key("local.tool@v1{variant=x}");
        assert_eq!(a.hash(), key("local.tool@v1").hash());
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);
    }

    #[test]
    fn fuzzy_match_rules() {
        let python_r4 = key("local.python@r4{version=3.14}");
        let python_v1 = key("vendor.python@v1");

        let bare = Query::parse("python");
        assert!(bare.matches(&python_r4));
        assert!(bare.matches(&python_v1));

        let ns_name = Query::parse("local.python");
        assert!(ns_name.matches(&python_r4));
        assert!(!ns_name.matches(&python_v1));

        let identity = Query::parse("local.python@r4");
        assert!(identity.matches(&python_r4));
        assert!(!identity.matches(&python_v1));

        let canon = Query::parse("local.python@r4{version=3.14}");
        assert!(canon.matches(&python_r4));
        assert!(!Query::parse("local.python@r4{version=3.15}").matches(&python_r4));

        let ruby = Query::parse("ruby");
        assert!(!ruby.matches(&python_r4));
        assert!(!ruby.matches(&python_v1));
    }

    #[test]
    fn junk_queries_match_nothing() {
        let k = key("local.python@r4");
        for q in ["", "a.b.c", "a@b", "local.python.extra"] {
            assert!(!Query::parse(q).matches(&k), "query {q:?} must not match");
        }
    }
}
