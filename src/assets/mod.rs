//! Asset dependency ordering, classification and bundling.

mod classify;
mod graph;
pub mod merge;
mod render;
mod types;

pub use classify::AssetClassifier;
pub use graph::DependencyGraphBuilder;
pub use merge::{Bundle, BundleMeta, BundleStore, MergeEngine, MergeError, MergeOptions};
pub use render::{AssetReference, HeadDirectives};
pub use types::{AssetDescriptor, AssetGroup, AssetKind, AssetRegistry, DependencyTree};
