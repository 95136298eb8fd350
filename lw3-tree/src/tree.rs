//! The tree: a root node plus path-based lookup.

use crate::error::TreeError;
use crate::node::Node;
use crate::path::split_path;
use std::path::Path;

/// Shared handle to a node tree.
#[derive(Clone, Debug)]
pub struct Tree {
    root: Node,
}

impl Tree {
    pub fn new() -> Self {
        Self {
            root: Node::new_root(),
        }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Looks up a node without creating anything.
    ///
    /// Returns `None` for malformed paths and for paths with a missing or
    /// non-node segment.
    pub fn resolve(&self, path: &str) -> Option<Node> {
        let segments = split_path(path).ok()?;
        let mut node = self.root.clone();
        for segment in segments {
            node = node.child(segment)?;
        }
        Some(node)
    }

    /// Looks up a node, creating every missing segment.
    pub fn node(&self, path: &str) -> Result<Node, TreeError> {
        let mut node = self.root.clone();
        for segment in split_path(path)? {
            node = node.child_or_create(segment)?;
        }
        Ok(node)
    }

    /// Merges a JSON document from a file into the root.
    pub fn load_json(&self, path: &Path) -> Result<(), TreeError> {
        let text = std::fs::read_to_string(path)?;
        let json: serde_json::Value = serde_json::from_str(&text)?;
        self.root.merge_json(&json)?;
        tracing::info!("Loaded tree from {}", path.display());
        Ok(())
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_resolve_never_creates() {
        let tree = Tree::new();
        assert!(tree.resolve("/PATH/TO/MY/NODE").is_none());
        assert!(tree.root().children().is_empty());

        let node = tree.node("/PATH/TO/MY/NODE").unwrap();
        assert_eq!(node.path(), "/PATH/TO/MY/NODE");
        assert!(tree.resolve("/PATH/TO/MY/NODE").unwrap().ptr_eq(&node));
        assert!(tree.resolve("/").unwrap().ptr_eq(tree.root()));
    }

    #[test]
    fn test_resolve_rejects_malformed_paths() {
        let tree = Tree::new();
        tree.node("/A/B").unwrap();
        assert!(tree.resolve("A/B").is_none());
        assert!(tree.resolve("/A//B").is_none());
        assert!(tree.resolve("/A/B/").is_none());
        assert!(tree.node("/A//B").is_err());
    }

    #[test]
    fn test_resolve_through_property_fails() {
        let tree = Tree::new();
        tree.node("/A").unwrap().set("B", 1).unwrap();
        assert!(tree.resolve("/A/B").is_none());
        assert!(tree.node("/A/B").is_err());
    }

    #[test]
    fn test_load_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"DEVICE": {{"Name": "Switcher", "Ports": 4}}}}"#).unwrap();

        let tree = Tree::new();
        tree.load_json(file.path()).unwrap();
        let device = tree.resolve("/DEVICE").unwrap();
        assert_eq!(device.property("Name").unwrap().value, "Switcher");

        let missing = tree.load_json(Path::new("/nonexistent/tree.json"));
        assert!(matches!(missing, Err(TreeError::Io(_))));
    }
}
