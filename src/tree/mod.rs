//! The archive file system tree.
//!
//! Maps normalized paths to nodes, maintains the parent→children adjacency,
//! and enforces the POSIX-ish rules of the mutation operations. The tree
//! itself is not synchronized; the owning controller serializes access
//! through its own lock.

use std::collections::BTreeMap;

use crate::entry::{Entry, EntryKind};
use crate::error::FsError;
use crate::path::NodePath;

mod node;

pub use node::Node;

/// A structural mutation, delivered to the listener before and after it is
/// applied.
#[derive(Debug, Clone)]
pub enum TreeEvent {
    Make { path: NodePath, kind: EntryKind },
    Unlink { path: NodePath },
    Copy { from: NodePath, to: NodePath },
}

/// Internal hook for the owning controller. At most one listener may be
/// registered; this is deliberately not a pub/sub mechanism.
pub trait TreeListener: Send + Sync {
    fn before_mutate(&mut self, event: &TreeEvent);
    fn after_mutate(&mut self, event: &TreeEvent);
}

/// Options for [`FileTree::make`].
#[derive(Debug, Default, Clone)]
pub struct MakeOptions {
    /// Auto-create missing ancestor directories. Off by default; callers
    /// opt in.
    pub create_parents: bool,
    /// Entry whose sizes, times and permissions seed the new entry.
    pub template: Option<Entry>,
}

pub struct FileTree {
    nodes: BTreeMap<NodePath, Node>,
    touched: bool,
    listener: Option<Box<dyn TreeListener>>,
}

impl Default for FileTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTree {
    /// An empty tree: just the root directory.
    pub fn new() -> FileTree {
        let mut nodes = BTreeMap::new();
        nodes.insert(NodePath::ROOT, Node::new(Entry::directory(NodePath::ROOT)));
        FileTree {
            nodes,
            touched: false,
            listener: None,
        }
    }

    /// Build a tree by replaying a container's entry enumeration.
    ///
    /// Normalization rules:
    /// - missing ancestors are synthesized as directories (an entry's parent
    ///   always implies a directory);
    /// - an entry at a path that already carries a different-kind entry is
    ///   kept alongside it (the node carries both views);
    /// - a later entry of the same kind at the same path replaces the
    ///   earlier one.
    ///
    /// Population is construction, not mutation: it neither marks the tree
    /// touched nor notifies listeners.
    pub fn from_entries<I: IntoIterator<Item = Entry>>(entries: I) -> FileTree {
        let mut tree = FileTree::new();
        for entry in entries {
            tree.ingest(entry);
        }
        tree
    }

    fn ingest(&mut self, entry: Entry) {
        let path = entry.path.clone();
        if path.is_root() {
            // A codec-supplied root entry refines the synthesized one.
            if entry.kind == EntryKind::Directory {
                self.nodes.get_mut(&NodePath::ROOT).unwrap().insert_entry(entry);
            }
            return;
        }

        // Walk down from the root, synthesizing directories as needed.
        let mut ancestors: Vec<NodePath> = vec![];
        let mut cursor = path.parent();
        while let Some(p) = cursor {
            cursor = p.parent();
            ancestors.push(p);
        }
        for ancestor in ancestors.into_iter().rev() {
            if !self.nodes.contains_key(&ancestor) {
                self.nodes
                    .insert(ancestor.clone(), Node::new(Entry::directory(ancestor.clone())));
            } else if !self.nodes[&ancestor].is_directory() {
                // A file with children: give the node a directory view too.
                let dir = Entry::directory(ancestor.clone());
                self.nodes.get_mut(&ancestor).unwrap().insert_entry(dir);
            }
            if !ancestor.is_root() {
                let parent = ancestor.parent().unwrap();
                let name = ancestor.filename().to_string();
                self.nodes.get_mut(&parent).unwrap().add_child(&name);
            }
        }

        let parent = path.parent().unwrap();
        let name = path.filename().to_string();
        self.nodes.get_mut(&parent).unwrap().add_child(&name);
        match self.nodes.get_mut(&path) {
            Some(node) => {
                node.insert_entry(entry);
            }
            None => {
                self.nodes.insert(path, Node::new(entry));
            }
        }
    }

    /// Whether any mutation happened since the tree was last considered
    /// synced.
    pub fn touched(&self) -> bool {
        self.touched
    }

    /// Mark the current state as durably committed.
    pub fn set_synced(&mut self) {
        self.touched = false;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Register the single mutation listener.
    pub fn register_listener(&mut self, listener: Box<dyn TreeListener>) -> Result<(), FsError> {
        if self.listener.is_some() {
            return Err(FsError::ListenerCapacityExceeded);
        }
        self.listener = Some(listener);
        Ok(())
    }

    pub fn unregister_listener(&mut self) -> Option<Box<dyn TreeListener>> {
        self.listener.take()
    }

    fn notify_before(&mut self, event: &TreeEvent) {
        if let Some(listener) = self.listener.as_mut() {
            listener.before_mutate(event);
        }
    }

    fn notify_after(&mut self, event: &TreeEvent) {
        self.touched = true;
        if let Some(listener) = self.listener.as_mut() {
            listener.after_mutate(event);
        }
    }

    pub fn resolve(&self, path: &NodePath) -> Option<&Node> {
        self.nodes.get(path)
    }

    pub fn resolve_mut(&mut self, path: &NodePath) -> Option<&mut Node> {
        self.nodes.get_mut(path)
    }

    pub fn contains(&self, path: &NodePath) -> bool {
        self.nodes.contains_key(path)
    }

    /// All entries, parents before children.
    pub fn entries(&self) -> Vec<Entry> {
        self.nodes
            .values()
            .flat_map(|node| node.entries().cloned())
            .collect()
    }

    /// Paths of all nodes, parents before children.
    pub fn paths(&self) -> Vec<NodePath> {
        self.nodes.keys().cloned().collect()
    }

    /// Create a new entry. The parent must already exist as a directory
    /// unless `create_parents` is set.
    pub fn make(
        &mut self,
        path: &NodePath,
        kind: EntryKind,
        options: &MakeOptions,
    ) -> Result<(), FsError> {
        if path.is_root() {
            return Err(FsError::AlreadyExists { path: path.clone() });
        }
        match kind {
            EntryKind::File | EntryKind::Directory => {}
            EntryKind::Symlink | EntryKind::Special => {
                return Err(FsError::UnsupportedKind { path: path.clone() });
            }
        }
        if self.nodes.contains_key(path) {
            return Err(FsError::AlreadyExists { path: path.clone() });
        }

        let parent = path.parent().expect("non-root path has a parent");
        match self.nodes.get(&parent) {
            Some(node) if node.is_directory() => {}
            Some(_) => return Err(FsError::NoSuchParent { path: path.clone() }),
            None if options.create_parents => {
                let ancestor_options = MakeOptions {
                    create_parents: true,
                    template: None,
                };
                self.make(&parent, EntryKind::Directory, &ancestor_options)?;
            }
            None => return Err(FsError::NoSuchParent { path: path.clone() }),
        }

        let event = TreeEvent::Make {
            path: path.clone(),
            kind,
        };
        self.notify_before(&event);

        let mut entry = Entry::new(path.clone(), kind);
        if let Some(template) = &options.template {
            entry.apply_template(template);
        }
        entry.touch();

        self.nodes
            .get_mut(&parent)
            .unwrap()
            .add_child(path.filename());
        self.nodes.insert(path.clone(), Node::new(entry));

        self.notify_after(&event);
        Ok(())
    }

    /// Remove the entry at `path`. Directories must be empty.
    pub fn unlink(&mut self, path: &NodePath) -> Result<Node, FsError> {
        if path.is_root() {
            return Err(FsError::AccessDenied { path: path.clone() });
        }
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| FsError::NotFound { path: path.clone() })?;
        if node.has_children() {
            return Err(FsError::NotEmpty { path: path.clone() });
        }

        let event = TreeEvent::Unlink { path: path.clone() };
        self.notify_before(&event);

        let node = self.nodes.remove(path).unwrap();
        let parent = path.parent().expect("non-root path has a parent");
        self.nodes
            .get_mut(&parent)
            .unwrap()
            .remove_child(path.filename());

        self.notify_after(&event);
        Ok(node)
    }

    /// Structurally copy the node at `from` (recursively) to `to`.
    ///
    /// This is the first half of a rename: copy, then unlink the source.
    /// Entry content is the controller's business; only the tree shape and
    /// entry attributes move here.
    pub fn copy(&mut self, from: &NodePath, to: &NodePath) -> Result<(), FsError> {
        if from.is_root() || to.is_root() {
            return Err(FsError::AccessDenied { path: to.clone() });
        }
        if !self.nodes.contains_key(from) {
            return Err(FsError::NotFound { path: from.clone() });
        }
        if self.nodes.contains_key(to) {
            return Err(FsError::AlreadyExists { path: to.clone() });
        }
        if to.starts_with(from) {
            return Err(FsError::AccessDenied { path: to.clone() });
        }
        let to_parent = to.parent().expect("non-root path has a parent");
        match self.nodes.get(&to_parent) {
            Some(node) if node.is_directory() => {}
            _ => return Err(FsError::NoSuchParent { path: to.clone() }),
        }

        let event = TreeEvent::Copy {
            from: from.clone(),
            to: to.clone(),
        };
        self.notify_before(&event);

        let moved: Vec<(NodePath, Node)> = self
            .nodes
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, n)| (p.clone(), n.clone()))
            .collect();

        for (old_path, old_node) in moved {
            let suffix = &old_path.as_str()[from.as_str().len()..];
            let new_path = NodePath(format!("{}{}", to.as_str(), suffix));
            let mut rebased = Node::new({
                let mut first = old_node.entries().next().unwrap().clone();
                first.path = new_path.clone();
                first
            });
            for entry in old_node.entries().skip(1) {
                let mut entry = entry.clone();
                entry.path = new_path.clone();
                rebased.insert_entry(entry);
            }
            for child in old_node.children() {
                rebased.add_child(child);
            }
            self.nodes.insert(new_path, rebased);
        }

        self.nodes
            .get_mut(&to_parent)
            .unwrap()
            .add_child(to.filename());

        self.notify_after(&event);
        Ok(())
    }
}
