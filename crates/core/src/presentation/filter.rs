use regex::Regex;
use serde::{Deserialize, Serialize};

/// How a filter pattern is matched against `class.method` names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterMode {
    /// Everything passes.
    #[default]
    None,
    StartsWith,
    Contains,
    EndsWith,
    Equals,
    /// The whole pattern is one regular expression, matched anywhere in the
    /// name.
    Regex,
}

/// User-facing filter setting. Apart from [`FilterMode::Regex`], the pattern
/// may hold several terms separated by whitespace or commas; a name passes
/// when any term matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterConfig {
    pub pattern: String,
    pub mode: FilterMode,
}

impl FilterConfig {
    pub fn new(pattern: impl Into<String>, mode: FilterMode) -> Self {
        Self {
            pattern: pattern.into(),
            mode,
        }
    }

    /// True when the configuration lets every name through.
    pub fn is_pass_all(&self) -> bool {
        self.mode == FilterMode::None || self.pattern.trim().is_empty()
    }

    pub fn compile(&self) -> Result<NameFilter, regex::Error> {
        if self.is_pass_all() {
            return Ok(NameFilter::All);
        }
        if self.mode == FilterMode::Regex {
            return Ok(NameFilter::Regex(Regex::new(self.pattern.trim())?));
        }
        let terms = self
            .pattern
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect();
        Ok(NameFilter::Terms {
            mode: self.mode,
            terms,
        })
    }
}

/// Compiled form of a [`FilterConfig`].
#[derive(Debug, Clone)]
pub enum NameFilter {
    All,
    Terms { mode: FilterMode, terms: Vec<String> },
    Regex(Regex),
}

impl NameFilter {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Regex(re) => re.is_match(name),
            Self::Terms { mode, terms } => terms.iter().any(|t| match mode {
                FilterMode::StartsWith => name.starts_with(t.as_str()),
                FilterMode::Contains => name.contains(t.as_str()),
                FilterMode::EndsWith => name.ends_with(t.as_str()),
                FilterMode::Equals => name == t,
                FilterMode::None | FilterMode::Regex => true,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiled(pattern: &str, mode: FilterMode) -> NameFilter {
        FilterConfig::new(pattern, mode).compile().unwrap()
    }

    #[test]
    fn empty_pattern_passes_everything() {
        assert!(FilterConfig::new("  ", FilterMode::Contains).is_pass_all());
        assert!(compiled("", FilterMode::Equals).matches("anything"));
        assert!(compiled("xyz", FilterMode::None).matches("anything"));
    }

    #[test]
    fn any_term_may_match() {
        let f = compiled("com.acme, org.demo", FilterMode::StartsWith);
        assert!(f.matches("com.acme.Main.run"));
        assert!(f.matches("org.demo.App.start"));
        assert!(!f.matches("java.lang.Thread.run"));
    }

    #[test]
    fn modes() {
        assert!(compiled("Main", FilterMode::Contains).matches("com.Main.run"));
        assert!(compiled(".run", FilterMode::EndsWith).matches("com.Main.run"));
        assert!(!compiled("Main", FilterMode::Equals).matches("com.Main.run"));
        assert!(compiled("com.Main.run", FilterMode::Equals).matches("com.Main.run"));
    }

    #[test]
    fn regex_is_not_split() {
        let f = compiled(r"^a{1,2}\.b$", FilterMode::Regex);
        assert!(f.matches("aa.b"));
        assert!(!f.matches("aaa.b"));
        assert!(FilterConfig::new("(", FilterMode::Regex).compile().is_err());
    }
}
