//! Factory resolution: which bundle provides a component's factory.

use std::collections::BTreeMap;
use std::sync::Arc;

use flock_core::{Bundle, Component};
use semver::{Version, VersionReq};
use tracing::{debug, error, warn};

use crate::error::{PlacementError, PlacementResult};

/// An artifact repository for one implementation language.
pub trait FactoryRepository: Send + Sync {
    fn language(&self) -> &str;

    /// Bundles providing `factory`, optionally restricted by bundle name
    /// and version requirement.
    fn find_factory(
        &self,
        factory: &str,
        bundle_name: Option<&str>,
        version: Option<&VersionReq>,
    ) -> Vec<Bundle>;
}

/// In-memory repository: factory → providing bundles.
#[derive(Debug, Clone, Default)]
pub struct StaticRepository {
    language: String,
    factories: BTreeMap<String, Vec<Bundle>>,
}

impl StaticRepository {
    pub fn new(language: &str) -> Self {
        Self {
            language: language.to_string(),
            factories: BTreeMap::new(),
        }
    }

    pub fn with_factory(mut self, factory: &str, bundle: Bundle) -> Self {
        self.factories.entry(factory.to_string()).or_default().push(bundle);
        self
    }
}

impl FactoryRepository for StaticRepository {
    fn language(&self) -> &str {
        &self.language
    }

    fn find_factory(
        &self,
        factory: &str,
        bundle_name: Option<&str>,
        version: Option<&VersionReq>,
    ) -> Vec<Bundle> {
        self.factories
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

/// Language of a repository serving every language; its bundles are
/// matched on their own language instead.
pub const ANY_LANGUAGE: &str = "*";

fn same_language(repository: &str, component: &str) -> bool {
    repository == component || (repository.starts_with("python") && component.starts_with("python"))
}

pub struct FactoryResolver {
    repositories: Vec<Arc<dyn FactoryRepository>>,
}

impl FactoryResolver {
    pub fn new(repositories: Vec<Arc<dyn FactoryRepository>>) -> Self {
        Self { repositories }
    }

    /// Highest-versioned bundle providing the component's factory.
    pub fn resolve(&self, component: &Component) -> PlacementResult<Bundle> {
        let requirement = match component.bundle_version.as_deref() {
            Some(raw) => match VersionReq::parse(raw) {
                Ok(req) => Some(req),
                Err(e) => {
                    warn!(
                        component = %component.name,
                        version = raw,
                        error = %e,
                        "invalid version requirement, ignoring"
                    );
                    None
                }
            },
            None => None,
        };

        let mut found: Vec<Bundle> = self
            .repositories
            .iter()
            .filter(|r| {
                r.language() == ANY_LANGUAGE || same_language(r.language(), &component.language)
            })
            .flat_map(|r| {
                let any = r.language() == ANY_LANGUAGE;
                r.find_factory(
                    &component.factory,
                    component.bundle_name.as_deref(),
                    requirement.as_ref(),
                )
                .into_iter()
                .filter(move |b| !any || same_language(&b.language, &component.language))
            })
            .collect();
        found.sort_by(|a, b| match (Version::parse(&a.version), Version::parse(&b.version)) {
            (Ok(va), Ok(vb)) => vb.cmp(&va),
            _ => b.version.cmp(&a.version),
        });

        match found.into_iter().next() {
            Some(bundle) => {
                debug!(
                    component = %component.name,
                    bundle = %bundle.name,
                    version = %bundle.version,
                    "factory resolved"
                );
                Ok(bundle)
            }
            None => Err(PlacementError::FactoryNotFound {
                component: component.name.clone(),
                factory: component.factory.clone(),
            }),
        }
    }
}

/// Installs bundles into a booting isolate.
pub trait BundleInstaller: Send + Sync {
    fn install(&self, isolate: &str, bundle: &Bundle) -> Result<(), String>;
}

/// Install `bundles` into `isolate`. An optional bundle that fails is
/// skipped; a mandatory one aborts the boot. Returns the installed bundles.
pub fn install_bundles(
    installer: &dyn BundleInstaller,
    isolate: &str,
    bundles: &[Bundle],
) -> PlacementResult<Vec<Bundle>> {
    let mut installed = Vec::with_capacity(bundles.len());
    for bundle in bundles {
        match installer.install(isolate, bundle) {
            Ok(()) => installed.push(bundle.clone()),
            Err(reason) if bundle.optional => {
                warn!(%isolate, bundle = %bundle.name, %reason, "optional bundle not installed");
            }
            Err(reason) => {
                error!(%isolate, bundle = %bundle.name, %reason, "mandatory bundle not installed");
                return Err(PlacementError::BundleInstallFailure {
                    isolate: isolate.to_string(),
                    bundle: bundle.name.clone(),
                    reason,
                });
            }
        }
    }
    Ok(installed)
}
