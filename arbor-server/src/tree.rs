//! The spanning-tree topology: one root node (ourselves) plus every
//! server behind every link, dual-indexed by name and SID.
//!
//! Nodes live in an arena and refer to each other through small
//! handles; the parent→children edges own, everything else (route,
//! uplink) is a weak back-reference. Removal is recursive and
//! deferred through a cull queue so pending I/O can finish before
//! slots are reused.

use std::collections::HashMap;

use arbor_proto::Sid;
use thiserror::Error;

use crate::util::{now_ms, wildcard_match};

/// Identifies a link socket. Handed out by the link registry.
pub type LinkId = u64;

/// A handle into the server arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerHandle(u32);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("server name {0} already exists")]
    NameInUse(String),
    #[error("server ID {0} already exists")]
    SidInUse(Sid),
    #[error("parent server is gone")]
    DeadParent,
}

/// One server on the network.
#[derive(Debug)]
pub struct ServerNode {
    pub name: String,
    pub sid: Sid,
    pub description: String,
    pub parent: Option<ServerHandle>,
    pub children: Vec<ServerHandle>,
    /// The direct child of the root through which this node is
    /// reached. The root routes to itself.
    pub route: ServerHandle,
    /// Uplink socket; set only on direct children of the root.
    pub link: Option<LinkId>,
    /// Nonzero while this node or an ancestor toward the burst source
    /// has not sent ENDBURST.
    pub behind_bursting: u32,
    pub dead: bool,
    pub hidden: bool,
    /// U-lined pseudo-server.
    pub service: bool,
    pub silent_service: bool,
    pub rawversion: String,
    pub rawbranch: String,
    pub customversion: String,
    pub user_count: u32,
    pub oper_count: u32,
    /// Last measured round-trip time, milliseconds.
    pub rtt_ms: u64,
    /// When this node's burst began, epoch milliseconds; zero after
    /// it finishes.
    pub burst_start_ms: u64,
}

impl ServerNode {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_bursting(&self) -> bool {
        self.behind_bursting > 0
    }
}

#[derive(Debug)]
pub struct Tree {
    slots: Vec<Option<ServerNode>>,
    by_name: HashMap<String, ServerHandle>,
    by_sid: HashMap<Sid, ServerHandle>,
    by_link: HashMap<LinkId, ServerHandle>,
    root: ServerHandle,
    cull_queue: Vec<ServerHandle>,
}

impl Tree {
    pub fn new(name: &str, sid: Sid, description: &str) -> Self {
        let root = ServerHandle(0);
        let node = ServerNode {
            name: name.to_string(),
            sid,
            description: description.to_string(),
            parent: None,
            children: Vec::new(),
            route: root,
            link: None,
            behind_bursting: 0,
            dead: false,
            hidden: false,
            service: false,
            silent_service: false,
            rawversion: String::new(),
            rawbranch: String::new(),
            customversion: String::new(),
            user_count: 0,
            oper_count: 0,
            rtt_ms: 0,
            burst_start_ms: 0,
        };
        let mut tree = Self {
            slots: vec![Some(node)],
            by_name: HashMap::new(),
            by_sid: HashMap::new(),
            by_link: HashMap::new(),
            root,
            cull_queue: Vec::new(),
        };
        tree.add_hash_entry(root);
        tree
    }

    pub fn root(&self) -> ServerHandle {
        self.root
    }

    pub fn get(&self, handle: ServerHandle) -> Option<&ServerNode> {
        self.slots.get(handle.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, handle: ServerHandle) -> Option<&mut ServerNode> {
        self.slots.get_mut(handle.0 as usize)?.as_mut()
    }

    /// Node lookup that treats dead nodes as gone.
    pub fn get_live(&self, handle: ServerHandle) -> Option<&ServerNode> {
        self.get(handle).filter(|n| !n.dead)
    }

    pub fn find_by_name(&self, name: &str) -> Option<ServerHandle> {
        self.by_name.get(&name.to_lowercase()).copied()
    }

    pub fn find_by_sid(&self, sid: Sid) -> Option<ServerHandle> {
        self.by_sid.get(&sid).copied()
    }

    /// First live server whose name matches a glob pattern.
    pub fn find_by_mask(&self, mask: &str) -> Option<ServerHandle> {
        let mut handles: Vec<&ServerHandle> = self.by_name.values().collect();
        handles.sort_by_key(|h| h.0);
        handles
            .into_iter()
            .copied()
            .find(|&h| self.get_live(h).is_some_and(|n| wildcard_match(mask, &n.name)))
    }

    /// The direct server node behind a link socket.
    pub fn find_by_link(&self, link: LinkId) -> Option<ServerHandle> {
        self.by_link.get(&link).copied()
    }

    /// The direct child of the root to send toward `target`; the root
    /// itself when `target` is the root.
    pub fn best_route_to(&self, target: ServerHandle) -> Option<ServerHandle> {
        Some(self.get_live(target)?.route)
    }

    /// The uplink socket used to reach `target`.
    pub fn link_to(&self, target: ServerHandle) -> Option<LinkId> {
        let route = self.best_route_to(target)?;
        self.get_live(route)?.link
    }

    fn add_hash_entry(&mut self, handle: ServerHandle) {
        let node = self.slots[handle.0 as usize].as_ref().expect("live node");
        self.by_name.insert(node.name.to_lowercase(), handle);
        self.by_sid.insert(node.sid, handle);
        if let Some(link) = node.link {
            self.by_link.insert(link, handle);
        }
    }

    fn remove_hash(&mut self, handle: ServerHandle) {
        let Some(node) = self.slots[handle.0 as usize].as_ref() else {
            return;
        };
        let (name, sid, link) = (node.name.to_lowercase(), node.sid, node.link);
        if self.by_name.get(&name) == Some(&handle) {
            self.by_name.remove(&name);
        }
        if self.by_sid.get(&sid) == Some(&handle) {
            self.by_sid.remove(&sid);
        }
        if let Some(link) = link {
            self.by_link.remove(&link);
        }
    }

    /// Introduces a server under `parent`. Name and SID must both be
    /// free. Direct children carry the uplink socket that owns them.
    pub fn add_server(
        &mut self,
        parent: ServerHandle,
        name: &str,
        sid: Sid,
        description: &str,
        hidden: bool,
        link: Option<LinkId>,
    ) -> Result<ServerHandle, TreeError> {
        if self.find_by_name(name).is_some() {
            return Err(TreeError::NameInUse(name.to_string()));
        }
        if self.find_by_sid(sid).is_some() {
            return Err(TreeError::SidInUse(sid));
        }
        let parent_node = self.get_live(parent).ok_or(TreeError::DeadParent)?;
        let behind_bursting = parent_node.behind_bursting;

        // Route: walk up from the parent until one step below the
        // root; a direct child routes through itself.
        let route = if parent == self.root {
            None // filled in below once the handle exists
        } else {
            let mut hop = parent;
            while let Some(p) = self.get(hop).and_then(|n| n.parent) {
                if p == self.root {
                    break;
                }
                hop = p;
            }
            Some(hop)
        };

        let handle = self.alloc();
        let route = route.unwrap_or(handle);
        let node = ServerNode {
            name: name.to_string(),
            sid,
            description: description.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            route,
            link,
            behind_bursting,
            dead: false,
            hidden,
            service: false,
            silent_service: false,
            rawversion: String::new(),
            rawbranch: String::new(),
            customversion: String::new(),
            user_count: 0,
            oper_count: 0,
            rtt_ms: 0,
            burst_start_ms: 0,
        };
        self.slots[handle.0 as usize] = Some(node);
        self.add_hash_entry(handle);
        if let Some(parent_node) = self.get_mut(parent) {
            parent_node.children.push(handle);
        }
        Ok(handle)
    }

    fn alloc(&mut self) -> ServerHandle {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.is_none() {
                return ServerHandle(i as u32);
            }
        }
        self.slots.push(None);
        ServerHandle((self.slots.len() - 1) as u32)
    }

    /// Recursively removes `target` and its subtree: detaches it from
    /// its parent, marks every node dead, deregisters both indices and
    /// queues the slots for culling. Returns the removed handles,
    /// subtree-deepest last.
    pub fn remove_server(&mut self, target: ServerHandle) -> Vec<ServerHandle> {
        if let Some(parent) = self.get(target).and_then(|n| n.parent) {
            if let Some(parent_node) = self.get_mut(parent) {
                parent_node.children.retain(|&c| c != target);
            }
        }
        let mut removed = Vec::new();
        self.cull_recursive(target, &mut removed);
        removed
    }

    fn cull_recursive(&mut self, handle: ServerHandle, removed: &mut Vec<ServerHandle>) {
        let children = match self.get_mut(handle) {
            Some(node) => {
                node.dead = true;
                node.children.clone()
            }
            None => return,
        };
        self.remove_hash(handle);
        removed.push(handle);
        self.cull_queue.push(handle);
        for child in children {
            self.cull_recursive(child, removed);
        }
    }

    /// Frees the slots of every culled node. Called once per tick,
    /// after handlers have finished touching the dead nodes.
    pub fn flush_culls(&mut self) -> usize {
        let count = self.cull_queue.len();
        for handle in std::mem::take(&mut self.cull_queue) {
            self.slots[handle.0 as usize] = None;
        }
        count
    }

    /// Marks a server as bursting. A start time in the future (clocks
    /// not synced) is replaced by the current time.
    pub fn begin_burst(&mut self, handle: ServerHandle, start_ms: u64) {
        let now = now_ms();
        if let Some(node) = self.get_mut(handle) {
            node.behind_bursting += 1;
            node.burst_start_ms = if start_ms == 0 || start_ms > now {
                now
            } else {
                start_ms
            };
            tracing::debug!(
                server = %node.name,
                behind_bursting = node.behind_bursting,
                "server started bursting"
            );
        }
    }

    /// Ends a burst for `handle` and everything behind it. Returns the
    /// burst duration in milliseconds.
    pub fn finish_burst(&mut self, handle: ServerHandle) -> u64 {
        let start = self.get(handle).map(|n| n.burst_start_ms).unwrap_or(0);
        let elapsed = now_ms().saturating_sub(start);
        if let Some(node) = self.get_mut(handle) {
            node.burst_start_ms = 0;
        }
        self.finish_burst_internal(handle);
        elapsed
    }

    fn finish_burst_internal(&mut self, handle: ServerHandle) {
        let children = match self.get_mut(handle) {
            Some(node) => {
                // 1202-era peers don't convey the bursting state of
                // servers introduced mid-burst, which may ENDBURST on
                // their own later; don't let that underflow.
                node.behind_bursting = node.behind_bursting.saturating_sub(1);
                node.children.clone()
            }
            None => return,
        };
        for child in children {
            self.finish_burst_internal(child);
        }
    }

    /// Live servers in depth-first order from the root, skipping
    /// `skip` and its whole subtree. This is the burst order.
    pub fn dfs_order(&self, skip: Option<ServerHandle>) -> Vec<ServerHandle> {
        let mut out = Vec::new();
        self.dfs_visit(self.root, skip, &mut out);
        out
    }

    fn dfs_visit(&self, handle: ServerHandle, skip: Option<ServerHandle>, out: &mut Vec<ServerHandle>) {
        if Some(handle) == skip || self.get_live(handle).is_none() {
            return;
        }
        out.push(handle);
        if let Some(node) = self.get(handle) {
            for &child in &node.children {
                self.dfs_visit(child, skip, out);
            }
        }
    }

    /// Count of live servers.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|node| !node.dead)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks the structural invariants; used by tests and debug
    /// assertions. Returns a description of the first violation.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut roots = 0;
        for (i, slot) in self.slots.iter().enumerate() {
            let Some(node) = slot else { continue };
            if node.dead {
                continue;
            }
            let handle = ServerHandle(i as u32);
            if node.parent.is_none() {
                roots += 1;
                continue;
            }
            let route = self
                .get_live(node.route)
                .ok_or_else(|| format!("{}: dead route", node.name))?;
            if route.parent != Some(self.root) {
                return Err(format!("{}: route is not a child of the root", node.name));
            }
            if route.link.is_none() {
                return Err(format!("{}: route has no uplink socket", node.name));
            }
            if self.find_by_name(&node.name) != Some(handle) {
                return Err(format!("{}: name index mismatch", node.name));
            }
            if self.find_by_sid(node.sid) != Some(handle) {
                return Err(format!("{}: sid index mismatch", node.name));
            }
        }
        if roots != 1 {
            return Err(format!("expected exactly one root, found {roots}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> Sid {
        s.parse().unwrap()
    }

    fn sample_tree() -> (Tree, ServerHandle, ServerHandle, ServerHandle) {
        // root(001) ── b(002, link 7) ── c(003) ── d(004)
        let mut tree = Tree::new("a.example.net", sid("001"), "root");
        let b = tree
            .add_server(tree.root(), "b.example.net", sid("002"), "b", false, Some(7))
            .unwrap();
        let c = tree
            .add_server(b, "c.example.net", sid("003"), "c", false, None)
            .unwrap();
        let d = tree
            .add_server(c, "d.example.net", sid("004"), "d", false, None)
            .unwrap();
        (tree, b, c, d)
    }

    #[test]
    fn routes_point_at_the_direct_child() {
        let (tree, b, c, d) = sample_tree();
        assert_eq!(tree.best_route_to(b), Some(b));
        assert_eq!(tree.best_route_to(c), Some(b));
        assert_eq!(tree.best_route_to(d), Some(b));
        assert_eq!(tree.link_to(d), Some(7));
        tree.check_invariants().unwrap();
    }

    #[test]
    fn duplicate_name_and_sid_are_refused() {
        let (mut tree, b, ..) = sample_tree();
        assert_eq!(
            tree.add_server(b, "C.EXAMPLE.NET", sid("009"), "x", false, None),
            Err(TreeError::NameInUse("C.EXAMPLE.NET".into()))
        );
        assert_eq!(
            tree.add_server(b, "e.example.net", sid("003"), "x", false, None),
            Err(TreeError::SidInUse(sid("003")))
        );
    }

    #[test]
    fn removal_is_recursive_and_deferred() {
        let (mut tree, b, c, d) = sample_tree();
        let removed = tree.remove_server(b);
        assert_eq!(removed, vec![b, c, d]);
        assert_eq!(tree.len(), 1);
        assert!(tree.find_by_sid(sid("003")).is_none());
        assert!(tree.find_by_name("d.example.net").is_none());
        // Slots are still allocated until the cull queue flushes.
        assert!(tree.get(b).is_some_and(|n| n.dead));
        assert_eq!(tree.flush_culls(), 3);
        assert!(tree.get(b).is_none());
        tree.check_invariants().unwrap();
    }

    #[test]
    fn mask_lookup() {
        let (tree, _, c, _) = sample_tree();
        assert_eq!(tree.find_by_mask("c.*"), Some(c));
        assert!(tree.find_by_mask("nosuch.*").is_none());
    }

    #[test]
    fn burst_counters_inherit_and_release() {
        let mut tree = Tree::new("a.example.net", sid("001"), "root");
        let b = tree
            .add_server(tree.root(), "b.example.net", sid("002"), "b", false, Some(1))
            .unwrap();
        tree.begin_burst(b, 0);
        // A server introduced mid-burst is behind its parent's burst.
        let c = tree
            .add_server(b, "c.example.net", sid("003"), "c", false, None)
            .unwrap();
        assert_eq!(tree.get(c).unwrap().behind_bursting, 1);
        tree.begin_burst(c, 0);
        assert_eq!(tree.get(c).unwrap().behind_bursting, 2);
        tree.finish_burst(c);
        assert_eq!(tree.get(c).unwrap().behind_bursting, 1);
        tree.finish_burst(b);
        assert!(!tree.get(b).unwrap().is_bursting());
        assert!(!tree.get(c).unwrap().is_bursting());
    }

    #[test]
    fn dfs_order_skips_a_subtree() {
        let (mut tree, b, ..) = sample_tree();
        let e = tree
            .add_server(tree.root(), "e.example.net", sid("005"), "e", false, Some(9))
            .unwrap();
        let order = tree.dfs_order(Some(b));
        assert_eq!(order, vec![tree.root(), e]);
    }
}
