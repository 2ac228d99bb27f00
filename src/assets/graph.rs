//! Dependency ordering for one render's asset queue.

use std::collections::HashSet;

use tracing::debug;

use super::types::{AssetDescriptor, AssetRegistry, DependencyTree};

struct Frame<'a> {
    asset: &'a AssetDescriptor,
    next_dep: usize,
}

/// Builds a [`DependencyTree`] from a registry snapshot and the queued handles.
///
/// Traversal is a depth-first post-order walk on an explicit stack. All bookkeeping lives inside
/// one `build` call, so repeated builds never influence each other. Unknown handles are skipped,
/// and a dependency that closes a cycle is ignored at the point it would re-enter the walk.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyGraphBuilder;

impl DependencyGraphBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build<S: AsRef<str>>(&self, registry: &AssetRegistry, queue: &[S]) -> DependencyTree {
        let mut emitted: HashSet<&str> = HashSet::new();
        let mut on_stack: HashSet<&str> = HashSet::new();
        let mut ordered = Vec::new();

        for root in queue {
            let Some(asset) = registry.get(root.as_ref()) else {
                debug!(handle = root.as_ref(), "Queued asset is not registered; skipping");
                continue;
            };
            if emitted.contains(asset.handle.as_str()) {
                continue;
            }

            let mut stack = vec![Frame { asset, next_dep: 0 }];
            on_stack.insert(asset.handle.as_str());

            while let Some(frame) = stack.last_mut() {
                let current = frame.asset;
                if let Some(dep) = current.deps.get(frame.next_dep) {
                    frame.next_dep += 1;
                    if emitted.contains(dep.as_str()) || on_stack.contains(dep.as_str()) {
                        continue;
                    }
                    match registry.get(dep) {
                        Some(dep_asset) => {
                            on_stack.insert(dep_asset.handle.as_str());
                            stack.push(Frame {
                                asset: dep_asset,
                                next_dep: 0,
                            });
                        }
                        None => debug!(
                            handle = current.handle.as_str(),
                            dependency = dep.as_str(),
                            "Dependency is not registered; skipping"
                        ),
                    }
                    continue;
                }

                stack.pop();
                on_stack.remove(current.handle.as_str());
                emitted.insert(current.handle.as_str());
                ordered.push(current.clone());
            }
        }

        DependencyTree::from_ordered(ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(assets: Vec<AssetDescriptor>) -> AssetRegistry {
        assets.into_iter().collect()
    }

    fn assert_dependencies_first(tree: &DependencyTree) {
        for (index, asset) in tree.iter().enumerate() {
            for dep in &asset.deps {
                if let Some(position) = tree.position(dep) {
                    assert!(position < index, "{dep} must precede {}", asset.handle);
                }
            }
        }
    }

    #[test]
    fn dependencies_precede_dependents() {
        let registry = registry(vec![
            AssetDescriptor::script("b", "/b.js").with_deps(["a"]),
            AssetDescriptor::script("a", "/a.js"),
        ]);

        let tree = DependencyGraphBuilder::new().build(&registry, &["b", "a"]);

        assert_eq!(tree.handles(), vec!["a", "b"]);
    }

    #[test]
    fn diamond_is_emitted_once_in_valid_order() {
        let registry = registry(vec![
            AssetDescriptor::script("base", "/base.js"),
            AssetDescriptor::script("left", "/l.js").with_deps(["base"]),
            AssetDescriptor::script("right", "/r.js").with_deps(["base"]),
            AssetDescriptor::script("app", "/app.js").with_deps(["left", "right"]),
        ]);

        let tree = DependencyGraphBuilder::new().build(&registry, &["app", "right"]);

        assert_eq!(tree.handles(), vec!["base", "left", "right", "app"]);
        assert_dependencies_first(&tree);
    }

    #[test]
    fn missing_handles_are_skipped() {
        let registry = registry(vec![
            AssetDescriptor::style("theme", "/theme.css").with_deps(["ghost"]),
        ]);

        let tree = DependencyGraphBuilder::new().build(&registry, &["phantom", "theme"]);

        assert_eq!(tree.handles(), vec!["theme"]);
    }

    #[test]
    fn cycles_terminate() {
        let registry = registry(vec![
            AssetDescriptor::script("x", "/x.js").with_deps(["y"]),
            AssetDescriptor::script("y", "/y.js").with_deps(["z"]),
            AssetDescriptor::script("z", "/z.js").with_deps(["x"]),
        ]);

        let tree = DependencyGraphBuilder::new().build(&registry, &["x"]);

        assert_eq!(tree.handles(), vec!["z", "y", "x"]);
    }

    #[test]
    fn builds_are_independent() {
        let registry = registry(vec![
            AssetDescriptor::script("a", "/a.js"),
            AssetDescriptor::script("b", "/b.js").with_deps(["a"]),
        ]);
        let builder = DependencyGraphBuilder::new();

        let first = builder.build(&registry, &["b"]);
        let second = builder.build(&registry, &["b"]);

        assert_eq!(first, second);
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn deep_chains_do_not_recurse() {
        let depth = 5_000;
        let registry: AssetRegistry = (0..depth)
            .map(|index| {
                let asset = AssetDescriptor::script(format!("h{index}"), format!("/{index}.js"));
                if index == 0 {
                    asset
                } else {
                    asset.with_deps([format!("h{}", index - 1)])
                }
            })
            .collect();

        let tree =
            DependencyGraphBuilder::new().build(&registry, &[format!("h{}", depth - 1)]);

        assert_eq!(tree.len(), depth);
        assert_eq!(tree.handles()[0], "h0");
    }
}
