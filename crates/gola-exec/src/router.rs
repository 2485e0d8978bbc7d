//! Language resolution and candidate ordering
//!
//! The router is a pure function over static configuration: it normalises the
//! caller's language string through the alias table and returns every provider
//! that declared support for the result, ordered by priority.

use crate::errors::ExecError;
use crate::types::ProviderDescriptor;
use std::collections::{BTreeSet, HashMap};

const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("py", "python"),
    ("python3", "python"),
    ("python", "python"),
    ("js", "javascript"),
    ("node", "javascript"),
    ("nodejs", "javascript"),
    ("javascript", "javascript"),
    ("ts", "typescript"),
    ("typescript", "typescript"),
    ("rb", "ruby"),
    ("ruby", "ruby"),
    ("go", "go"),
    ("golang", "go"),
    ("rs", "rust"),
    ("rust", "rust"),
    ("c", "c"),
    ("cpp", "cpp"),
    ("c++", "cpp"),
    ("cxx", "cpp"),
    ("java", "java"),
    ("sh", "bash"),
    ("bash", "bash"),
    ("shell", "bash"),
    ("php", "php"),
];

#[derive(Debug, Clone)]
pub struct LanguageRouter {
    aliases: HashMap<String, String>,
    // Registration order is the tie-breaker, so this stays a Vec.
    providers: Vec<ProviderDescriptor>,
}

impl LanguageRouter {
    pub fn new(providers: Vec<ProviderDescriptor>) -> Self {
        let aliases = BUILTIN_ALIASES
            .iter()
            .map(|(alias, canonical)| (alias.to_string(), canonical.to_string()))
            .collect();
        Self { aliases, providers }
    }

    /// Merges operator-defined aliases over the built-in table.
    pub fn with_aliases(mut self, extra: &HashMap<String, String>) -> Self {
        for (alias, canonical) in extra {
            self.aliases.insert(
                alias.trim().to_lowercase(),
                canonical.trim().to_lowercase(),
            );
        }
        self
    }

    pub fn canonicalize(&self, raw: &str) -> String {
        let key = raw.trim().to_lowercase();
        self.aliases.get(&key).cloned().unwrap_or(key)
    }

    pub fn resolve(&self, raw: &str) -> Result<(String, Vec<ProviderDescriptor>), ExecError> {
        let canonical = self.canonicalize(raw);
        let mut candidates: Vec<(usize, &ProviderDescriptor)> = self
            .providers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.supports(&canonical))
            .collect();

        if candidates.is_empty() {
            return Err(ExecError::UnsupportedLanguage(raw.trim().to_string()));
        }

        candidates.sort_by_key(|(index, p)| (p.priority, *index));
        let ordered = candidates.into_iter().map(|(_, p)| p.clone()).collect();
        Ok((canonical, ordered))
    }

    pub fn languages(&self) -> BTreeSet<String> {
        self.providers
            .iter()
            .flat_map(|p| p.supported_languages.iter().cloned())
            .collect()
    }
}
