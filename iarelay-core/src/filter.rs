use glob::{Pattern, PatternError};

/// Name filter for item files.
///
/// The pattern string holds one or more glob alternatives separated by `|`,
/// e.g. `*.pdf|*.epub`. A name is kept when any alternative matches it.
#[derive(Debug, Clone)]
pub struct FileFilter {
    source: String,
    patterns: Vec<Pattern>,
}

impl FileFilter {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let patterns = pattern
            .split('|')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(Pattern::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            source: pattern.to_string(),
            patterns,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}
