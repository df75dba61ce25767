//! Group accumulators keyed by each group-by value in turn.

use indexmap::IndexMap;

use crate::domain::value::Value;

#[derive(Debug)]
enum GroupNode {
    Branch(IndexMap<Value, GroupNode>),
    Leaf(Vec<Value>),
}

/// Nested first-seen-ordered maps, one level per group-by expression, with
/// an accumulator row at each leaf.
#[derive(Debug)]
pub struct GroupTable {
    root: GroupNode,
    width: usize,
    depth: usize,
    groups: usize,
}

impl GroupTable {
    pub fn new(depth: usize, width: usize) -> Self {
        let root = if depth == 0 {
            GroupNode::Leaf(vec![Value::Null; width])
        } else {
            GroupNode::Branch(IndexMap::new())
        };
        Self {
            root,
            width,
            depth,
            groups: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups == 0
    }

    /// Accumulator row for `keys`, created when absent. Creation is refused
    /// once `cap` groups exist.
    pub fn entry(&mut self, keys: Vec<Value>, cap: Option<usize>) -> Option<&mut [Value]> {
        let may_create = cap.is_none_or(|c| self.groups < c);
        let width = self.width;
        let depth = self.depth;
        let mut created = false;
        let mut node = &mut self.root;
        for (level, key) in keys.into_iter().enumerate() {
            let GroupNode::Branch(children) = node else {
                return None;
            };
            if !children.contains_key(&key) {
                if !may_create {
                    return None;
                }
                let child = if level + 1 == depth {
                    created = true;
                    GroupNode::Leaf(vec![Value::Null; width])
                } else {
                    GroupNode::Branch(IndexMap::new())
                };
                children.insert(key.clone(), child);
            }
            node = children.get_mut(&key)?;
        }
        if depth == 0 && self.groups == 0 {
            if !may_create {
                return None;
            }
            created = true;
        }
        if created {
            self.groups += 1;
        }
        match node {
            GroupNode::Leaf(row) => Some(row.as_mut_slice()),
            GroupNode::Branch(_) => None,
        }
    }

    /// Accumulator rows in first-seen order.
    pub fn into_rows(self) -> Vec<Vec<Value>> {
        let mut rows = Vec::with_capacity(self.groups);
        if self.groups > 0 {
            flatten(self.root, &mut rows);
        }
        rows
    }
}

fn flatten(node: GroupNode, rows: &mut Vec<Vec<Value>>) {
    match node {
        GroupNode::Leaf(row) => rows.push(row),
        GroupNode::Branch(children) => {
            for (_, child) in children {
                flatten(child, rows);
            }
        }
    }
}
