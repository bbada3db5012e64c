//! Nested file browser tree built from flat paths.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A directory or file node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub children: Vec<TreeNode>,
}

#[derive(Default)]
struct Trie {
    dirs: BTreeMap<String, Trie>,
    files: BTreeMap<String, ()>,
}

/// Build the browser tree: directories first, then files, each group sorted
/// by name.
pub fn build_file_tree<I, S>(paths: I) -> Vec<TreeNode>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut root = Trie::default();
    for path in paths {
        let mut segments: Vec<&str> = path.as_ref().split('/').filter(|s| !s.is_empty()).collect();
        let Some(file) = segments.pop() else { continue };
        let mut node = &mut root;
        for seg in segments {
            node = node.dirs.entry(seg.to_string()).or_default();
        }
        node.files.insert(file.to_string(), ());
    }
    collect(&root, "")
}

fn collect(trie: &Trie, prefix: &str) -> Vec<TreeNode> {
    let join = |name: &str| {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        }
    };

    let mut nodes = Vec::with_capacity(trie.dirs.len() + trie.files.len());
    for (name, sub) in &trie.dirs {
        let path = join(name);
        nodes.push(TreeNode {
            name: name.clone(),
            children: collect(sub, &path),
            path,
            is_dir: true,
        });
    }
    for name in trie.files.keys() {
        nodes.push(TreeNode {
            name: name.clone(),
            path: join(name),
            is_dir: false,
            children: Vec::new(),
        });
    }
    nodes
}

/// Indented text rendering, two spaces per level, directories suffixed `/`.
pub fn render(nodes: &[TreeNode]) -> String {
    fn walk(nodes: &[TreeNode], depth: usize, out: &mut String) {
        for node in nodes {
            out.push_str(&"  ".repeat(depth));
            out.push_str(&node.name);
            if node.is_dir {
                out.push('/');
            }
            out.push('\n');
            walk(&node.children, depth + 1, out);
        }
    }
    let mut out = String::new();
    walk(nodes, 0, &mut out);
    out
}
