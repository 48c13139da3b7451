//! Factories announced at runtime.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use flock_core::Bundle;
use flock_placement::{ANY_LANGUAGE, FactoryRepository};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Payload of the factory registered/unregistered signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryAnnouncement {
    pub factory: String,
    pub language: String,
    /// Providing bundle; the factory name when absent.
    #[serde(default)]
    pub bundle: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl FactoryAnnouncement {
    pub fn new(factory: &str, language: &str) -> Self {
        Self {
            factory: factory.to_string(),
            language: language.to_string(),
            bundle: None,
            version: None,
        }
    }

    fn to_bundle(&self) -> Bundle {
        Bundle {
            name: self.bundle.clone().unwrap_or_else(|| self.factory.clone()),
            version: self.version.clone().unwrap_or_else(|| "0.0.0".to_string()),
            language: self.language.clone(),
            optional: false,
        }
    }
}

/// Repository of every language, fed by factory announcements.
#[derive(Debug, Default)]
pub struct FactoryCatalog {
    factories: RwLock<BTreeMap<String, Vec<Bundle>>>,
}

impl FactoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, announcement: &FactoryAnnouncement) {
        let bundle = announcement.to_bundle();
        let mut factories = self.write();
        let bundles = factories.entry(announcement.factory.clone()).or_default();
        bundles.retain(|b| !(b.name == bundle.name && b.version == bundle.version));
        info!(
            factory = %announcement.factory,
            language = %bundle.language,
            bundle = %bundle.name,
            "factory registered"
        );
        bundles.push(bundle);
    }

    /// Forget every bundle of `factory` in `language`. Returns whether any was known.
    pub fn unregister(&self, factory: &str, language: &str) -> bool {
        let mut factories = self.write();
        let Some(bundles) = factories.get_mut(factory) else {
            return false;
        };
        let before = bundles.len();
        bundles.retain(|b| b.language != language);
        let removed = bundles.len() != before;
        if bundles.is_empty() {
            factories.remove(factory);
        }
        if removed {
            info!(%factory, %language, "factory unregistered");
        }
        removed
    }

    pub fn factories(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Vec<Bundle>>> {
        self.factories.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Vec<Bundle>>> {
        self.factories.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FactoryRepository for FactoryCatalog {
    fn language(&self) -> &str {
        ANY_LANGUAGE
    }

    fn find_factory(
        &self,
        factory: &str,
        bundle_name: Option<&str>,
        version: Option<&VersionReq>,
    ) -> Vec<Bundle> {
        self.read()
            .get(factory)
            .into_iter()
            .flatten()
            .filter(|b| bundle_name.is_none_or(|name| b.name == name))
            .filter(|b| match (version, Version::parse(&b.version)) {
                (None, _) => true,
                (Some(req), Ok(v)) => req.matches(&v),
                (Some(_), Err(_)) => false,
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_core::Component;
    use flock_placement::FactoryResolver;
    use std::sync::Arc;

    #[test]
    fn announcements_feed_the_resolver() {
        let catalog = Arc::new(FactoryCatalog::new());
        let repository: Arc<dyn FactoryRepository> = catalog.clone();
        let resolver = FactoryResolver::new(vec![repository]);
        let component = Component::new("a", "factory.a", "python");
        assert!(resolver.resolve(&component).is_err());

        let mut announcement = FactoryAnnouncement::new("factory.a", "python");
        announcement.version = Some("1.4.0".to_string());
        catalog.register(&announcement);
        catalog.register(&announcement);
        let bundle = resolver.resolve(&component).unwrap();
        assert_eq!((bundle.name.as_str(), bundle.version.as_str()), ("factory.a", "1.4.0"));
        assert_eq!(catalog.find_factory("factory.a", None, None).len(), 1);

        assert!(!catalog.unregister("factory.a", "java"));
        assert!(catalog.unregister("factory.a", "python"));
        assert!(catalog.factories().is_empty());
        assert!(resolver.resolve(&component).is_err());
    }
}
