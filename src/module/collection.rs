use super::module::{Module, ModuleNode};
use crate::error::{Diagnostic, Result, StoreError};

/// The tree of module nodes, rooted at the store's root module.
pub(crate) struct ModuleCollection {
    root: ModuleNode,
}

impl ModuleCollection {
    /// Build the tree for `raw_root` and all its nested modules.
    pub(crate) fn new(raw_root: &Module) -> Self {
        let mut root = ModuleNode::new(raw_root);
        for (key, raw_child) in raw_root.children() {
            root.add_child(key.clone(), build(raw_child));
        }
        Self { root }
    }

    pub(crate) fn root(&self) -> &ModuleNode {
        &self.root
    }

    pub(crate) fn get(&self, path: &[String]) -> Option<&ModuleNode> {
        path.iter()
            .try_fold(&self.root, |node, key| node.child(key))
    }

    pub(crate) fn get_mut(&mut self, path: &[String]) -> Option<&mut ModuleNode> {
        path.iter()
            .try_fold(&mut self.root, |node, key| node.child_mut(key))
    }

    pub(crate) fn is_registered(&self, path: &[String]) -> bool {
        self.get(path).is_some()
    }

    /// Namespace prefix for `path`: every namespaced node along the way
    /// contributes `key/`, every other node contributes nothing.
    pub(crate) fn namespace(&self, path: &[String]) -> String {
        let mut node = &self.root;
        let mut namespace = String::new();
        for key in path {
            match node.child(key) {
                Some(child) => {
                    if child.namespaced {
                        namespace.push_str(key);
                        namespace.push('/');
                    }
                    node = child;
                }
                None => break,
            }
        }
        namespace
    }

    /// Attach a node built from `raw` (and its nested modules) at `path`.
    ///
    /// Every segment but the last must already resolve.
    pub(crate) fn register(&mut self, path: &[String], raw: &Module) -> Result<()> {
        let (key, parent_path) = path.split_last().ok_or(StoreError::RootRegistration)?;
        let parent = self
            .get_mut(parent_path)
            .ok_or_else(|| StoreError::ModuleNotFound(parent_path.to_vec()))?;
        parent.add_child(key.clone(), build(raw));
        tracing::debug!(path = ?path, "module registered");
        Ok(())
    }

    /// Detach the node at `path`. Returns `None` if nothing was registered there.
    pub(crate) fn unregister(&mut self, path: &[String]) -> Result<Option<ModuleNode>> {
        let (key, parent_path) = path.split_last().ok_or(StoreError::RootUnregistration)?;
        let removed = self
            .get_mut(parent_path)
            .and_then(|parent| parent.remove_child(key));
        if removed.is_some() {
            tracing::debug!(path = ?path, "module unregistered");
        }
        Ok(removed)
    }

    /// Swap in the handlers of `raw_root` for every existing node it matches.
    ///
    /// Modules present on only one side are reported and skipped: state shape
    /// never changes here.
    pub(crate) fn update(&mut self, raw_root: &Module) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        update_node(&mut Vec::new(), &mut self.root, raw_root, &mut diagnostics);
        diagnostics
    }
}

fn build(raw: &Module) -> ModuleNode {
    let mut node = ModuleNode::new(raw);
    for (key, raw_child) in raw.children() {
        node.add_child(key.clone(), build(raw_child));
    }
    node
}

fn update_node(
    path: &mut Vec<String>,
    target: &mut ModuleNode,
    raw: &Module,
    diagnostics: &mut Vec<Diagnostic>,
) {
    target.update(raw);

    let Some(raw_children) = &raw.modules else {
        return;
    };

    for (key, raw_child) in raw_children {
        path.push(key.clone());
        match target.child_mut(key) {
            Some(child) => update_node(path, child, raw_child, diagnostics),
            None => diagnostics.push(Diagnostic::HotUpdateAdded { path: path.clone() }),
        }
        path.pop();
    }

    for (key, _) in target.children() {
        if !raw_children.contains_key(key) {
            let mut removed = path.clone();
            removed.push(key.clone());
            diagnostics.push(Diagnostic::HotUpdateRemoved { path: removed });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    fn tree() -> ModuleCollection {
        ModuleCollection::new(
            &Module::new().module(
                "a",
                Module::new()
                    .namespaced(true)
                    .module("b", Module::new().module("c", Module::new().namespaced(true))),
            ),
        )
    }

    #[test]
    fn nested_modules_are_built() {
        let modules = tree();
        assert!(modules.is_registered(&path(&["a", "b", "c"])));
        assert!(!modules.is_registered(&path(&["a", "x"])));
        assert!(modules.is_registered(&[]));
    }

    #[test]
    fn namespace_skips_plain_segments() {
        let modules = tree();
        assert_eq!(modules.namespace(&[]), "");
        assert_eq!(modules.namespace(&path(&["a"])), "a/");
        assert_eq!(modules.namespace(&path(&["a", "b"])), "a/");
        assert_eq!(modules.namespace(&path(&["a", "b", "c"])), "a/c/");
    }

    #[test]
    fn register_requires_parent() {
        let mut modules = tree();
        let err = modules
            .register(&path(&["missing", "child"]), &Module::new())
            .unwrap_err();
        assert_eq!(err, StoreError::ModuleNotFound(path(&["missing"])));

        assert_eq!(
            modules.register(&[], &Module::new()).unwrap_err(),
            StoreError::RootRegistration
        );
    }

    #[test]
    fn register_and_unregister_round_trip() {
        let mut modules = tree();
        modules
            .register(&path(&["a", "d"]), &Module::new().state(json!({ "x": 1 })))
            .unwrap();
        assert_eq!(
            modules.get(&path(&["a", "d"])).map(|n| n.state.clone()),
            Some(json!({ "x": 1 }))
        );

        assert!(modules.unregister(&path(&["a", "d"])).unwrap().is_some());
        assert!(!modules.is_registered(&path(&["a", "d"])));
        assert!(modules.unregister(&path(&["a", "d"])).unwrap().is_none());
        assert_eq!(
            modules.unregister(&[]).unwrap_err(),
            StoreError::RootUnregistration
        );
    }

    #[test]
    fn update_reports_added_and_removed_modules() {
        let mut modules = tree();
        let diagnostics = modules.update(
            &Module::new()
                .module("a", Module::new().getter("g", |_| Value::Null))
                .module("z", Module::new()),
        );

        assert_eq!(
            diagnostics,
            vec![Diagnostic::HotUpdateAdded { path: path(&["z"]) }]
        );
        // "a" did not list its children, so "b" is left alone silently.
        assert!(modules.is_registered(&path(&["a", "b"])));
        assert!(!modules.is_registered(&path(&["z"])));
        // namespaced is always taken from the new definition
        assert!(!modules.get(&path(&["a"])).map(|n| n.namespaced).unwrap_or(true));

        let diagnostics = modules.update(&Module::new().module("other", Module::new()));
        assert_eq!(
            diagnostics,
            vec![
                Diagnostic::HotUpdateAdded { path: path(&["other"]) },
                Diagnostic::HotUpdateRemoved { path: path(&["a"]) },
            ]
        );
        assert!(modules.is_registered(&path(&["a"])));
    }
}
