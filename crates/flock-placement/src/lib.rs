//! flock-placement — two-tier placement of components.
//!
//! # Architecture
//!
//! ```text
//! TopComposer
//!   └── NodeDistributor (grouping criteria → node buckets)
//!         └── DistributionStore (hand-off to node composers)
//!
//! NodeComposer
//!   ├── FactoryResolver (missing factories are excluded)
//!   ├── IsolateDistributor
//!   │     └── VoteEngine<EligibleIsolate> + electors
//!   └── PlacementStores (ratings, compatibilities, isolate history)
//! ```
//!
//! Tier 1 never fails: components no criterion groups land on the default
//! node. Tier 2 runs one approval vote per component, in name order, over
//! the node's isolates plus a neutral candidate standing for a new isolate.
//! A configured isolate pin wins by coup.

pub mod candidate;
pub mod composer;
pub mod distributor;
pub mod electors;
pub mod error;
pub mod grouping;
pub mod resolver;

pub use candidate::{EligibleIsolate, hosts_language};
pub use composer::{NodeComposer, NodePlacement, PlacementStores, TopComposer};
pub use distributor::{
    IsolateDistributor, IsolateElector, IsolatePlan, NodeDistributor, vote_engine_from_config,
};
pub use electors::{
    CompatibilityElector, ConfiguredIsolateElector, HistoryElector, ReliabilityElector,
};
pub use error::{PlacementError, PlacementResult};
pub use grouping::{
    ConfiguredNodeCriterion, GroupingCriterion, HistoryNodeCriterion, LanguageGroupCriterion,
};
pub use resolver::{
    ANY_LANGUAGE, BundleInstaller, FactoryRepository, FactoryResolver, StaticRepository,
    install_bundles,
};
