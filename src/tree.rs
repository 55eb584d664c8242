//! In-memory representation of an asar index.
//!
//! The tree is an arena of [`Node`]s addressed by [`NodeId`].  Directories keep their children in
//! index order for listing, along with a name lookup table.  Links store their target as a string
//! relative to the archive root; they are only resolved when a lookup walks through them.

use std::collections::HashMap;

use log::trace;
use thiserror::Error;

use crate::integrity::Integrity;

/// Upper bound on link hops within a single lookup, in the spirit of `ELOOP`.
pub const MAX_LINK_HOPS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);
}

/// Addressing data for a regular file in the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub size: u64,
    /// Relative to the start of the payload region.  Meaningless for unpacked files.
    pub offset: u64,
    pub unpacked: bool,
    pub executable: bool,
    pub integrity: Option<Integrity>,
}

#[derive(Debug, Default)]
pub struct Directory {
    children: Vec<NodeId>,
    lookup: HashMap<Box<str>, NodeId>,
}

impl Directory {
    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.lookup.get(name).copied()
    }

    /// Child ids in index order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

#[derive(Debug)]
pub enum Kind {
    File(FileEntry),
    Directory(Directory),
    Link(Box<str>),
}

#[derive(Debug)]
pub struct Node {
    pub name: Box<str>,
    /// `None` only for the root.
    pub parent: Option<NodeId>,
    pub kind: Kind,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("No such file or directory: {0:?}")]
    NotFound(String),
    #[error("Not a directory: {0:?}")]
    NotADirectory(String),
    #[error("Too many levels of links: {0:?}")]
    LinkCycle(String),
}

pub type LookupResult<T> = Result<T, LookupError>;

/// The outcome of a successful lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    /// The final node, never a link.
    pub id: NodeId,
    /// How many links were followed on the way.
    pub link_hops: usize,
}

/// Splits a virtual path into its segments.
///
/// Both `/` and `\` separate segments.  Empty and `.` segments are dropped.  Returns `None` if
/// the path contains a `..` segment: there is nothing above the archive root.
pub fn normalize(path: &str) -> Option<Vec<&str>> {
    let mut segments = vec![];
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return None,
            name => segments.push(name),
        }
    }
    Some(segments)
}

#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    /// Number of nodes, the root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn kind(&self, id: NodeId) -> &Kind {
        &self.node(id).kind
    }

    /// The canonical virtual path of `id`, without a leading separator.
    pub fn path_of(&self, id: NodeId) -> String {
        let mut names = vec![];
        let mut current = id;
        while let Some(parent) = self.node(current).parent {
            names.push(self.node(current).name.as_ref());
            current = parent;
        }
        names.reverse();
        names.join("/")
    }

    /// Looks up `path`, following links in intermediate and final position.
    pub fn resolve(&self, path: &str) -> LookupResult<Resolved> {
        let mut resolver = Resolver {
            tree: self,
            path,
            active: vec![],
            hops: 0,
        };
        let id = resolver.walk(path)?;
        let id = resolver.follow(id)?;
        trace!("resolved {path:?} to {id:?} via {} link(s)", resolver.hops);
        Ok(Resolved {
            id,
            link_hops: resolver.hops,
        })
    }

    /// Lists the names in the directory at `path`, in index order.
    pub fn children(&self, path: &str) -> LookupResult<Vec<&str>> {
        let resolved = self.resolve(path)?;
        match self.kind(resolved.id) {
            Kind::Directory(dir) => Ok(dir
                .children()
                .iter()
                .map(|id| self.node(*id).name.as_ref())
                .collect()),
            _ => Err(LookupError::NotADirectory(path.to_string())),
        }
    }

    /// All regular files in the tree with their full virtual paths, in index order.
    ///
    /// Links are not followed.
    pub fn files(&self) -> Vec<(String, &FileEntry)> {
        let mut files = vec![];
        let mut stack = vec![(String::new(), NodeId::ROOT)];
        while let Some((path, id)) = stack.pop() {
            match self.kind(id) {
                Kind::File(entry) => files.push((path, entry)),
                Kind::Directory(dir) => {
                    for child in dir.children().iter().rev() {
                        let name = &self.node(*child).name;
                        let child_path = match path.as_str() {
                            "" => name.to_string(),
                            _ => format!("{path}/{name}"),
                        };
                        stack.push((child_path, *child));
                    }
                }
                Kind::Link(_) => {}
            }
        }
        files
    }
}

struct Resolver<'t> {
    tree: &'t Tree,
    path: &'t str,
    /// Links currently being followed; meeting one of them again means a cycle.
    active: Vec<NodeId>,
    hops: usize,
}

impl<'t> Resolver<'t> {
    fn not_found(&self) -> LookupError {
        LookupError::NotFound(self.path.to_string())
    }

    /// Walks `path` from the root.  The returned node may itself be a link.
    fn walk(&mut self, path: &str) -> LookupResult<NodeId> {
        let tree = self.tree;
        let segments = normalize(path).ok_or_else(|| self.not_found())?;

        let mut current = NodeId::ROOT;
        for segment in segments {
            current = self.follow(current)?;
            current = match tree.kind(current) {
                Kind::Directory(dir) => dir.get(segment).ok_or_else(|| self.not_found())?,
                _ => return Err(self.not_found()),
            };
        }
        Ok(current)
    }

    fn follow(&mut self, mut id: NodeId) -> LookupResult<NodeId> {
        let tree = self.tree;
        let depth = self.active.len();

        while let Kind::Link(target) = tree.kind(id) {
            if self.active.contains(&id) || self.hops == MAX_LINK_HOPS {
                return Err(LookupError::LinkCycle(self.path.to_string()));
            }
            self.active.push(id);
            self.hops += 1;
            id = self.walk(target)?;
        }

        self.active.truncate(depth);
        Ok(id)
    }
}

/// Incrementally builds a [`Tree`], starting with an empty root directory.
#[derive(Debug)]
pub struct TreeBuilder {
    nodes: Vec<Node>,
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                name: "".into(),
                parent: None,
                kind: Kind::Directory(Directory::default()),
            }],
        }
    }

    fn add(&mut self, parent: NodeId, name: &str, kind: Kind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: name.into(),
            parent: Some(parent),
            kind,
        });

        let Kind::Directory(dir) = &mut self.nodes[parent.0].kind else {
            unreachable!("parent {parent:?} is not a directory");
        };
        // Later duplicates replace earlier ones, keeping the original listing position.
        match dir.lookup.insert(name.into(), id) {
            Some(old) => {
                if let Some(slot) = dir.children.iter_mut().find(|c| **c == old) {
                    *slot = id;
                }
            }
            None => dir.children.push(id),
        }
        id
    }

    pub fn add_directory(&mut self, parent: NodeId, name: &str) -> NodeId {
        self.add(parent, name, Kind::Directory(Directory::default()))
    }

    pub fn add_file(&mut self, parent: NodeId, name: &str, entry: FileEntry) -> NodeId {
        self.add(parent, name, Kind::File(entry))
    }

    pub fn add_link(&mut self, parent: NodeId, name: &str, target: &str) -> NodeId {
        self.add(parent, name, Kind::Link(target.into()))
    }

    pub fn build(self) -> Tree {
        Tree { nodes: self.nodes }
    }
}
