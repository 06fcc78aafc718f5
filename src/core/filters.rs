//! Include/exclude rules handed to the backup engine.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Rule set applied to a share's contents.
///
/// Regex includes and regex excludes are mutually exclusive. Regexes are
/// matched against paths relative to the share root, using `/` separators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRules {
    /// Glob patterns passed straight to the engine.
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub include_regex: Vec<String>,
    #[serde(default)]
    pub exclude_regex: Vec<String>,
    /// Skip any directory containing one of these file names.
    #[serde(default)]
    pub exclude_if_present: Vec<String>,
    /// Match exclude globs case-insensitively.
    #[serde(default)]
    pub case_insensitive: bool,
}

impl FilterRules {
    /// Pick the rules for a share.
    ///
    /// Share rules replace device rules entirely when set, even when empty.
    pub fn resolve<'a>(
        share: Option<&'a FilterRules>,
        device: Option<&'a FilterRules>,
        defaults: &'a FilterRules,
    ) -> &'a FilterRules {
        share.or(device).unwrap_or(defaults)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.include_regex.is_empty() && !self.exclude_regex.is_empty() {
            return Err(Error::InvalidRules(
                "include_regex and exclude_regex cannot both be set".to_string(),
            ));
        }

        if let Some(blank) = self
            .exclude
            .iter()
            .chain(self.exclude_if_present.iter())
            .find(|p| p.trim().is_empty())
        {
            return Err(Error::InvalidRules(format!("blank pattern '{}'", blank)));
        }

        self.regex_filter().map(|_| ())
    }

    pub fn has_regex(&self) -> bool {
        !self.include_regex.is_empty() || !self.exclude_regex.is_empty()
    }

    pub fn regex_filter(&self) -> Result<RegexFilter> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| Error::InvalidRules(format!("regex '{}': {}", p, e)))
                })
                .collect()
        };

        Ok(RegexFilter {
            include: compile(&self.include_regex)?,
            exclude: compile(&self.exclude_regex)?,
        })
    }
}

pub struct RegexFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl RegexFilter {
    /// Whether a file at `relative_path` should be backed up.
    pub fn selects(&self, relative_path: &str) -> bool {
        if !self.include.is_empty() {
            return self.include.iter().any(|re| re.is_match(relative_path));
        }
        !self.exclude.iter().any(|re| re.is_match(relative_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules_with_exclude(glob: &str) -> FilterRules {
        FilterRules {
            exclude: vec![glob.to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_share_rules_replace_device_rules() {
        let share = FilterRules::default();
        let device = rules_with_exclude("*.iso");
        let defaults = rules_with_exclude("*.tmp");

        let resolved = FilterRules::resolve(Some(&share), Some(&device), &defaults);
        assert!(resolved.exclude.is_empty());
    }

    #[test]
    fn test_device_rules_then_defaults() {
        let device = rules_with_exclude("*.iso");
        let defaults = rules_with_exclude("*.tmp");

        let resolved = FilterRules::resolve(None, Some(&device), &defaults);
        assert_eq!(resolved.exclude, vec!["*.iso"]);

        let resolved = FilterRules::resolve(None, None, &defaults);
        assert_eq!(resolved.exclude, vec!["*.tmp"]);
    }

    #[test]
    fn test_regex_include_and_exclude_conflict() {
        let rules = FilterRules {
            include_regex: vec![r"\.jpg$".into()],
            exclude_regex: vec![r"\.tmp$".into()],
            ..Default::default()
        };
        assert!(matches!(rules.validate(), Err(Error::InvalidRules(_))));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let rules = FilterRules {
            exclude_regex: vec!["(unclosed".into()],
            ..Default::default()
        };
        assert!(rules.validate().is_err());
    }

    #[test]
    fn test_regex_filter_selection() {
        let include = FilterRules {
            include_regex: vec![r"\.jpg$".into()],
            ..Default::default()
        }
        .regex_filter()
        .unwrap();
        assert!(include.selects("2024/beach.jpg"));
        assert!(!include.selects("2024/notes.txt"));

        let exclude = FilterRules {
            exclude_regex: vec![r"^cache/".into()],
            ..Default::default()
        }
        .regex_filter()
        .unwrap();
        assert!(!exclude.selects("cache/blob"));
        assert!(exclude.selects("docs/readme.md"));
    }
}
