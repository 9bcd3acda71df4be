use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::error::{ProxyError, Result};

/// How a pattern string is interpreted.
///
/// `Posix` and `Pcre` both compile through the `regex` crate; the split is
/// kept because configurations declare which dialect they were written for,
/// and constructs the crate cannot express are rejected at load time with
/// the dialect named in the diagnostic.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PatternFlavor {
    #[default]
    Posix,
    Pcre,
    Exact,
    Prefix,
    Suffix,
    Contain,
}

impl PatternFlavor {
    pub fn is_regex(self) -> bool {
        matches!(self, PatternFlavor::Posix | PatternFlavor::Pcre)
    }
}

/// Capture vector filled by the last successful regex match along an
/// accepted condition path. Slot 0 is the whole match.
pub type Captures = Vec<Option<String>>;

/// Maximum number of capture slots carried over into rewrite templates.
pub const MAX_CAPTURES: usize = 10;

#[derive(Debug, Clone)]
enum Engine {
    Regex(Regex),
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contain(String),
}

/// A compiled pattern: regex, or one of the literal comparison modes.
#[derive(Debug, Clone)]
pub struct Matcher {
    pattern: String,
    engine: Engine,
    icase: bool,
}

impl Matcher {
    pub fn compile(pattern: &str, flavor: PatternFlavor, icase: bool) -> Result<Matcher> {
        Self::compile_full(pattern, flavor, icase, false)
    }

    /// Compile with explicit multiline control (header-block matching
    /// forces multiline on).
    pub fn compile_full(
        pattern: &str,
        flavor: PatternFlavor,
        icase: bool,
        multiline: bool,
    ) -> Result<Matcher> {
        let engine = match flavor {
            PatternFlavor::Posix | PatternFlavor::Pcre => {
                let re = RegexBuilder::new(pattern)
                    .case_insensitive(icase)
                    .multi_line(multiline)
                    .build()
                    .map_err(|e| ProxyError::Pattern {
                        pattern: pattern.to_string(),
                        reason: e.to_string(),
                    })?;
                Engine::Regex(re)
            }
            PatternFlavor::Exact => Engine::Exact(Self::fold(pattern, icase)),
            PatternFlavor::Prefix => Engine::Prefix(Self::fold(pattern, icase)),
            PatternFlavor::Suffix => Engine::Suffix(Self::fold(pattern, icase)),
            PatternFlavor::Contain => Engine::Contain(Self::fold(pattern, icase)),
        };
        Ok(Matcher { pattern: pattern.to_string(), engine, icase })
    }

    fn fold(s: &str, icase: bool) -> String {
        if icase {
            s.to_ascii_lowercase()
        } else {
            s.to_string()
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, text: &str) -> bool {
        match &self.engine {
            Engine::Regex(re) => re.is_match(text),
            Engine::Exact(p) => Self::fold(text, self.icase) == *p,
            Engine::Prefix(p) => Self::fold(text, self.icase).starts_with(p.as_str()),
            Engine::Suffix(p) => Self::fold(text, self.icase).ends_with(p.as_str()),
            Engine::Contain(p) => Self::fold(text, self.icase).contains(p.as_str()),
        }
    }

    /// Match and return the capture vector. Literal modes never produce
    /// captures; they report a bare hit so callers can keep the previous
    /// vector intact.
    pub fn captures(&self, text: &str) -> Option<Captures> {
        match &self.engine {
            Engine::Regex(re) => re.captures(text).map(|c| {
                let n = c.len().min(MAX_CAPTURES);
                let mut out: Captures = vec![None; n];
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = c.get(i).map(|m| m.as_str().to_string());
                }
                out
            }),
            _ => None,
        }
    }
}
