//! Node-tree mirror: the engine's live group/synth tree as a flat array.
//!
//! The engine maintains up to [`TREE_MAX_NODES`] fixed-width entries right
//! after the metrics block, so one contiguous byte-copy captures both.
//! Entries use index links (parent, siblings, first child) instead of
//! pointers; empty slots carry id = -1. `version` increments on every
//! topological change and is the readers' consistency token.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Capacity of the mirror.
pub const TREE_MAX_NODES: usize = 1024;

/// Fixed width of the null-terminated definition name, in bytes.
pub const TREE_NAME_BYTES: usize = 32;

/// Words per entry: id, parent, flags, prev, next, head + name.
pub const TREE_ENTRY_WORDS: usize = 6 + TREE_NAME_BYTES / 4;

/// Words in the mirror header: node_count, version.
pub const TREE_HEADER_WORDS: usize = 2;

/// Total words in the mirror block.
pub const TREE_WORDS: usize = TREE_HEADER_WORDS + TREE_MAX_NODES * TREE_ENTRY_WORDS;

/// Slot id marking an empty entry.
pub const TREE_EMPTY_ID: i32 = -1;

/// One live node in the mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTreeEntry {
    pub id: i32,
    pub parent: i32,
    pub is_group: bool,
    pub prev: i32,
    pub next: i32,
    /// First child (groups only; -1 otherwise).
    pub head: i32,
    /// Definition name for synths; empty for groups.
    pub name: String,
}

impl NodeTreeEntry {
    /// Serialize into `TREE_ENTRY_WORDS` little-endian words.
    pub fn write_words(&self, words: &mut [u32]) {
        debug_assert!(words.len() >= TREE_ENTRY_WORDS);
        words[0] = self.id as u32;
        words[1] = self.parent as u32;
        words[2] = self.is_group as u32;
        words[3] = self.prev as u32;
        words[4] = self.next as u32;
        words[5] = self.head as u32;
        let mut name = [0u8; TREE_NAME_BYTES];
        let n = self.name.len().min(TREE_NAME_BYTES - 1);
        name[..n].copy_from_slice(&self.name.as_bytes()[..n]);
        for (i, chunk) in name.chunks_exact(4).enumerate() {
            words[6 + i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }

    /// Decode one entry; `None` for empty slots.
    pub fn from_words(words: &[u32]) -> Option<Self> {
        debug_assert!(words.len() >= TREE_ENTRY_WORDS);
        let id = words[0] as i32;
        if id < 0 {
            return None;
        }
        let mut name = Vec::with_capacity(TREE_NAME_BYTES);
        'outer: for w in &words[6..TREE_ENTRY_WORDS] {
            for b in w.to_le_bytes() {
                if b == 0 {
                    break 'outer;
                }
                name.push(b);
            }
        }
        Some(Self {
            id,
            parent: words[1] as i32,
            is_group: words[2] != 0,
            prev: words[3] as i32,
            next: words[4] as i32,
            head: words[5] as i32,
            name: String::from_utf8_lossy(&name).into_owned(),
        })
    }
}

/// A decoded tree read: flat entries plus the consistency header.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeTree {
    pub version: u32,
    pub node_count: u32,
    pub nodes: Vec<NodeTreeEntry>,
}

impl NodeTree {
    /// Decode a mirror word block (header + entries). Reads at most
    /// `node_count` live entries.
    pub fn from_words(words: &[u32]) -> Self {
        debug_assert!(words.len() >= TREE_HEADER_WORDS);
        let node_count = words[0];
        let version = words[1];
        let mut nodes = Vec::with_capacity(node_count as usize);
        let mut offset = TREE_HEADER_WORDS;
        while offset + TREE_ENTRY_WORDS <= words.len() && (nodes.len() as u32) < node_count {
            if let Some(entry) = NodeTreeEntry::from_words(&words[offset..]) {
                nodes.push(entry);
            }
            offset += TREE_ENTRY_WORDS;
        }
        Self {
            version,
            node_count,
            nodes,
        }
    }

    /// Parent id → child ids, one pass. Children appear in slot order,
    /// which matches the engine's sibling order for freshly-built mirrors.
    pub fn children(&self) -> HashMap<i32, Vec<i32>> {
        let mut map: HashMap<i32, Vec<i32>> = HashMap::new();
        for node in &self.nodes {
            if node.parent >= 0 {
                map.entry(node.parent).or_default().push(node.id);
            }
        }
        map
    }

    pub fn get(&self, id: i32) -> Option<&NodeTreeEntry> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Live node ids in slot order.
    pub fn ids(&self) -> Vec<i32> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    /// Hierarchical view: roots with nested children, built from the
    /// flat index links in one pass over the entries.
    pub fn hierarchy(&self) -> Vec<TreeNode> {
        let children = self.children();
        self.nodes
            .iter()
            .filter(|n| n.parent < 0 || self.get(n.parent).is_none())
            .map(|n| self.build_node(n, &children))
            .collect()
    }

    fn build_node(&self, entry: &NodeTreeEntry, children: &HashMap<i32, Vec<i32>>) -> TreeNode {
        let child_nodes = children
            .get(&entry.id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.get(*id))
                    .map(|c| self.build_node(c, children))
                    .collect()
            })
            .unwrap_or_default();
        TreeNode {
            entry: entry.clone(),
            children: child_nodes,
        }
    }
}

/// One node of the hierarchical view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub entry: NodeTreeEntry,
    pub children: Vec<TreeNode>,
}
