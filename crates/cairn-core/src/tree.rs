use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::blob::BlobType;
use crate::error::{CairnError, Result};
use crate::id::Id;
use crate::repo::Repository;

/// One directory entry: a file (with its chunk ids), a subdirectory (with its
/// subtree id), or a symlink. The storage core only moves these around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Chunk ids making up a file's content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<Id>>,
    /// Tree blob id of a subdirectory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtree: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linktarget: Option<String>,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        self.node_type == "dir"
    }
}

/// A directory listing: nodes in strictly ascending name order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the sorted position; a second node with the same name is an
    /// error.
    pub fn insert(&mut self, node: Node) -> Result<()> {
        match self.nodes.binary_search_by(|n| n.name.as_str().cmp(&node.name)) {
            Ok(_) => Err(CairnError::InvalidFormat(format!(
                "node '{}' already present",
                node.name
            ))),
            Err(pos) => {
                self.nodes.insert(pos, node);
                Ok(())
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<&Node> {
        self.nodes
            .binary_search_by(|n| n.name.as_str().cmp(name))
            .ok()
            .map(|pos| &self.nodes[pos])
    }

    /// Ids of all subtrees referenced by this tree.
    pub fn subtrees(&self) -> Vec<Id> {
        self.nodes.iter().filter_map(|n| n.subtree).collect()
    }
}

/// Streams nodes straight into the serialized `{"nodes":[…]}` document, so a
/// large directory never materializes as a node graph. Enforces strictly
/// ascending name order; out-of-order input is an error.
pub struct TreeBuilder {
    buf: Vec<u8>,
    last_name: String,
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self {
            buf: b"{\"nodes\":[".to_vec(),
            last_name: String::new(),
        }
    }

    pub fn add_node(&mut self, node: &Node) -> Result<()> {
        if !self.last_name.is_empty() {
            self.buf.push(b',');
        }
        if node.name <= self.last_name {
            return Err(CairnError::InvalidFormat(format!(
                "nodes are not ordered: got '{}' after '{}'",
                node.name, self.last_name
            )));
        }
        self.last_name = node.name.clone();
        serde_json::to_writer(&mut self.buf, node)?;
        Ok(())
    }

    /// Close the document. The trailing newline keeps the bytes identical to
    /// what a line-oriented JSON encoder would have produced.
    pub fn finalize(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(b"]}\n");
        self.buf
    }
}

/// Serialize `tree` through a [`TreeBuilder`] and store it as a tree blob.
pub fn save_tree(repo: &Repository, tree: &Tree) -> Result<Id> {
    let mut builder = TreeBuilder::new();
    for node in &tree.nodes {
        builder.add_node(node)?;
    }
    let encoded = builder.finalize();
    let (id, _known) = repo.save_blob(BlobType::Tree, &encoded, None, false)?;
    Ok(id)
}

pub fn load_tree(repo: &Repository, id: &Id) -> Result<Tree> {
    let data = repo.load_blob(BlobType::Tree, id)?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_node(name: &str) -> Node {
        Node {
            name: name.to_string(),
            node_type: "file".to_string(),
            mode: Some(0o644),
            mtime: None,
            size: Some(0),
            content: Some(Vec::new()),
            subtree: None,
            linktarget: None,
        }
    }

    #[test]
    fn insert_keeps_names_sorted() {
        let mut tree = Tree::new();
        tree.insert(file_node("zeta")).unwrap();
        tree.insert(file_node("alpha")).unwrap();
        tree.insert(file_node("mid")).unwrap();

        let names: Vec<&str> = tree.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        assert!(tree.find("mid").is_some());
        assert!(tree.find("nope").is_none());
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut tree = Tree::new();
        tree.insert(file_node("same")).unwrap();
        assert!(tree.insert(file_node("same")).is_err());
    }

    #[test]
    fn builder_output_parses_back() {
        let mut builder = TreeBuilder::new();
        builder.add_node(&file_node("a")).unwrap();
        builder.add_node(&file_node("b")).unwrap();
        let bytes = builder.finalize();
        assert!(bytes.ends_with(b"]}\n"));

        let tree: Tree = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(tree.nodes.len(), 2);
        assert_eq!(tree.nodes[0].name, "a");
    }

    #[test]
    fn builder_rejects_out_of_order_nodes() {
        let mut builder = TreeBuilder::new();
        builder.add_node(&file_node("m")).unwrap();
        assert!(builder.add_node(&file_node("a")).is_err());
        // Equal names are out of order too.
        let mut builder = TreeBuilder::new();
        builder.add_node(&file_node("m")).unwrap();
        assert!(builder.add_node(&file_node("m")).is_err());
    }

    #[test]
    fn empty_builder_produces_empty_tree() {
        let bytes = TreeBuilder::new().finalize();
        let tree: Tree = serde_json::from_slice(&bytes).unwrap();
        assert!(tree.nodes.is_empty());
    }

    #[test]
    fn builder_matches_serde_encoding() {
        // The streamed bytes must parse to the same tree that Tree's own
        // serde produces, so readers can use either.
        let mut tree = Tree::new();
        tree.insert(file_node("one")).unwrap();
        tree.insert(Node {
            name: "sub".into(),
            node_type: "dir".into(),
            mode: Some(0o755),
            mtime: None,
            size: None,
            content: None,
            subtree: Some(Id::hash(b"subtree")),
            linktarget: None,
        })
        .unwrap();

        let mut builder = TreeBuilder::new();
        for node in &tree.nodes {
            builder.add_node(node).unwrap();
        }
        let streamed: Tree = serde_json::from_slice(&builder.finalize()).unwrap();
        assert_eq!(streamed, tree);
        assert_eq!(streamed.subtrees(), vec![Id::hash(b"subtree")]);
    }
}
