use std::collections::{BTreeMap, BTreeSet};

use crate::entry::{Entry, EntryKind};

/// One node of the file system tree.
///
/// A node may carry entries of *different* kinds at the same path. This
/// happens transiently during copy-based renames, and permanently for
/// archives that genuinely contain, say, both `a` and `a/b`. In steady state
/// there is exactly one entry per kind.
#[derive(Debug, Clone)]
pub struct Node {
    entries: BTreeMap<EntryKind, Entry>,
    children: BTreeSet<String>,
}

impl Node {
    pub fn new(entry: Entry) -> Node {
        let mut entries = BTreeMap::new();
        entries.insert(entry.kind, entry);
        Node {
            entries,
            children: BTreeSet::new(),
        }
    }

    pub fn entry(&self, kind: EntryKind) -> Option<&Entry> {
        self.entries.get(&kind)
    }

    pub fn entry_mut(&mut self, kind: EntryKind) -> Option<&mut Entry> {
        self.entries.get_mut(&kind)
    }

    /// The entry used when the node is addressed without a kind. The
    /// DIRECTORY view wins for traversal; otherwise the sole entry.
    pub fn primary(&self) -> &Entry {
        self.entries
            .get(&EntryKind::Directory)
            .or_else(|| self.entries.values().next())
            .expect("node without entries")
    }

    pub fn primary_mut(&mut self) -> &mut Entry {
        if self.entries.contains_key(&EntryKind::Directory) {
            return self.entries.get_mut(&EntryKind::Directory).unwrap();
        }
        self.entries.values_mut().next().expect("node without entries")
    }

    /// Insert or replace the entry of this kind. Returns the replaced one.
    pub fn insert_entry(&mut self, entry: Entry) -> Option<Entry> {
        self.entries.insert(entry.kind, entry)
    }

    pub fn remove_entry(&mut self, kind: EntryKind) -> Option<Entry> {
        self.entries.remove(&kind)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn kinds(&self) -> impl Iterator<Item = EntryKind> + '_ {
        self.entries.keys().copied()
    }

    pub fn is_directory(&self) -> bool {
        self.entries.contains_key(&EntryKind::Directory)
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn children(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(|s| s.as_str())
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub(crate) fn add_child(&mut self, name: &str) {
        self.children.insert(name.to_string());
    }

    pub(crate) fn remove_child(&mut self, name: &str) {
        self.children.remove(name);
    }
}
