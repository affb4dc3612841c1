use crate::sources::{builtin_sources, Source};
use crate::{Error, Result};
use std::sync::{Arc, OnceLock};

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// Ordered catalog of sources, read-only once built.
pub struct Registry {
    sources: Vec<Arc<dyn Source>>,
}

impl Registry {
    pub fn new(sources: Vec<Arc<dyn Source>>) -> Self {
        Self { sources }
    }

    /// Process wide registry of the bundled sources.
    pub fn global() -> &'static Registry {
        GLOBAL.get_or_init(|| Registry::new(builtin_sources()))
    }

    pub fn all_sources(&self) -> Vec<Arc<dyn Source>> {
        self.sources.clone()
    }

    pub fn default_sources(&self) -> Vec<Arc<dyn Source>> {
        self.sources
            .iter()
            .filter(|source| source.is_default())
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Source>> {
        let name = name.trim();
        self.sources
            .iter()
            .find(|source| source.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Case-insensitive lookup, in the order asked. Asking twice for a source yields it once.
    pub fn by_names<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Arc<dyn Source>>> {
        let mut selected: Vec<Arc<dyn Source>> = Vec::with_capacity(names.len());
        for name in names {
            let source = self
                .get(name.as_ref())
                .ok_or_else(|| Error::UnknownSource(name.as_ref().to_string()))?;
            if !selected.iter().any(|known| known.name() == source.name()) {
                selected.push(source);
            }
        }
        Ok(selected)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|source| source.name()).collect()
    }

    pub fn display_all(&self) {
        println!("\nSources (* default, ~ recursive, $ needs api key)");
        for source in &self.sources {
            let flags = format!(
                "{}{}{}",
                if source.is_default() { "*" } else { " " },
                if source.has_recursive_support() { "~" } else { " " },
                if source.needs_key() { "$" } else { " " },
            );
            println!("- {:18}{} {}", source.name(), flags, source.description());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_holds_bundled_sources() {
        let registry = Registry::global();

        assert_eq!(
            registry.names(),
            vec!["crtsh", "hackertarget", "securitytrails", "webarchive"]
        );
        assert!(registry
            .default_sources()
            .iter()
            .all(|source| source.is_default()));
        // same instances on every call
        assert!(Arc::ptr_eq(
            &registry.get("crtsh").unwrap(),
            &Registry::global().get("crtsh").unwrap()
        ));
    }

    #[test]
    fn by_names_is_case_insensitive() {
        let registry = Registry::global();

        let sources = registry.by_names(&["CrtSh", " webarchive", "crtsh"]).unwrap();
        let names: Vec<&str> = sources.iter().map(|source| source.name()).collect();

        assert_eq!(names, vec!["crtsh", "webarchive"]);
    }

    #[test]
    fn unknown_name_fails() {
        let err = Registry::global()
            .by_names(&["crtsh", "nope"])
            .err()
            .unwrap();

        assert!(matches!(err, Error::UnknownSource(name) if name == "nope"));
    }
}
