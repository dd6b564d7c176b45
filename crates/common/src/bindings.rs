use std::collections::HashMap;

use crate::types::{LocalId, NodeHandle};

/// Association between local mirror entries and remote nodes.
///
/// Kept as two tables consulted by both sides, never as pointers stored on
/// the nodes, so either side can be torn down without leaving a dangling
/// reference in the other. Each side binds to at most one partner.
#[derive(Debug, Default)]
pub struct Bindings {
    node_to_local: HashMap<NodeHandle, LocalId>,
    local_to_node: HashMap<LocalId, NodeHandle>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a pair, releasing any previous partner of either side.
    pub fn bind(&mut self, local: LocalId, node: NodeHandle) {
        if self.local_to_node.get(&local) == Some(&node) {
            return;
        }
        self.unbind_local(&local);
        self.unbind_node(&node);
        self.node_to_local.insert(node, local);
        self.local_to_node.insert(local, node);
    }

    pub fn unbind_local(&mut self, local: &LocalId) -> Option<NodeHandle> {
        let node = self.local_to_node.remove(local)?;
        self.node_to_local.remove(&node);
        Some(node)
    }

    pub fn unbind_node(&mut self, node: &NodeHandle) -> Option<LocalId> {
        let local = self.node_to_local.remove(node)?;
        self.local_to_node.remove(&local);
        Some(local)
    }

    pub fn node_of(&self, local: &LocalId) -> Option<NodeHandle> {
        self.local_to_node.get(local).copied()
    }

    pub fn local_of(&self, node: &NodeHandle) -> Option<LocalId> {
        self.node_to_local.get(node).copied()
    }

    pub fn len(&self) -> usize {
        self.local_to_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local_to_node.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::SyncId;

    #[test]
    fn test_rebinding_releases_previous_partners() {
        let mut bindings = Bindings::new();
        let a = LocalId::new(SyncId(1), 1);
        let b = LocalId::new(SyncId(1), 2);
        let x = NodeHandle::from_u64(10);
        let y = NodeHandle::from_u64(11);

        bindings.bind(a, x);
        bindings.bind(b, x);
        assert_eq!(bindings.node_of(&a), None);
        assert_eq!(bindings.local_of(&x), Some(b));

        bindings.bind(b, y);
        assert_eq!(bindings.local_of(&x), None);
        assert_eq!(bindings.node_of(&b), Some(y));
        assert_eq!(bindings.len(), 1);
    }
}
