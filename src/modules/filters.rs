//! Predicates for picking modules out of the registry.

use regex::Regex;

use super::Module;
use crate::value::ValueKind;

type Predicate = dyn Fn(&Module) -> bool + Send + Sync;

/// A test applied to each module during a search.
pub struct Filter(Box<Predicate>);

impl Filter {
    pub fn new<F>(predicate: F) -> Filter
    where
        F: Fn(&Module) -> bool + Send + Sync + 'static,
    {
        Filter(Box::new(predicate))
    }

    pub fn matches(&self, module: &Module) -> bool {
        (self.0)(module)
    }
}

/// Something to look for in a module's source text.
#[derive(Debug, Clone)]
pub enum SourcePattern {
    /// Matches if the source contains the text anywhere.
    Text(String),
    Regex(Regex),
}

impl SourcePattern {
    fn is_match(&self, source: &str) -> bool {
        match self {
            SourcePattern::Text(text) => source.contains(text.as_str()),
            SourcePattern::Regex(regex) => regex.is_match(source),
        }
    }
}

impl From<&str> for SourcePattern {
    fn from(text: &str) -> Self {
        SourcePattern::Text(text.to_string())
    }
}

impl From<String> for SourcePattern {
    fn from(text: String) -> Self {
        SourcePattern::Text(text)
    }
}

impl From<Regex> for SourcePattern {
    fn from(regex: Regex) -> Self {
        SourcePattern::Regex(regex)
    }
}

/// Matches modules whose source text contains (or matches) the pattern. This is how unnamed
/// functions are found: by a string literal that only appears in their body.
pub fn by_source(pattern: impl Into<SourcePattern>) -> Filter {
    let pattern = pattern.into();
    Filter::new(move |module| pattern.is_match(module.source()))
}

/// Matches modules that export every one of the given names.
pub fn by_props<I, S>(props: I) -> Filter
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let props: Vec<String> = props.into_iter().map(Into::into).collect();

    Filter::new(move |module| {
        let exports = module.exports();
        props.iter().all(|prop| exports.contains(prop))
    })
}

/// Matches modules that export `name` with a value of the given kind.
pub fn by_prop_type(name: impl Into<String>, kind: ValueKind) -> Filter {
    let name = name.into();

    Filter::new(move |module| {
        module
            .exports()
            .get(&name)
            .map_or(false, |value| value.kind() == kind)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Function, Object, Value};

    fn module(source: &str, exports: Object) -> Module {
        Module::new("test", exports, source)
    }

    #[test]
    fn source_text_and_regex() {
        let m = module(
            r#"function(e){return e.GUILD_BOOSTER_LEVEL_1,"badge"}"#,
            Object::new(),
        );

        assert!(by_source(".GUILD_BOOSTER_LEVEL_1,").matches(&m));
        assert!(!by_source(".GUILD_BOOSTER_LEVEL_2,").matches(&m));
        assert!(by_source(Regex::new(r"LEVEL_\d,").unwrap()).matches(&m));
    }

    #[test]
    fn props_must_all_exist() {
        let m = module("", Object::new().with("x", 2).with("y", 3));

        assert!(by_props(["y"]).matches(&m));
        assert!(by_props(["x", "y"]).matches(&m));
        assert!(!by_props(["x", "z"]).matches(&m));
    }

    #[test]
    fn prop_type_checks_the_kind() {
        let exports = Object::new()
            .with("containerWithContent", "container-1a2b")
            .with("render", Function::new(|_| Ok(Value::Null)));
        let m = module("", exports);

        assert!(by_prop_type("containerWithContent", ValueKind::String).matches(&m));
        assert!(by_prop_type("render", ValueKind::Function).matches(&m));
        assert!(!by_prop_type("render", ValueKind::String).matches(&m));
        assert!(!by_prop_type("missing", ValueKind::String).matches(&m));
    }
}
