//! Concurrent binary tree of pipelines ordered by next fire time.
//!
//! Every node owns one [`PipelineSchedule`]; its key is the fire time of the
//! pipeline's first undispatched step, tie-broken by link order so equal fire
//! times stay first-come first-served. The leftmost node therefore always
//! holds the next step due anywhere in the broker.
//!
//! Locking is split in two levels:
//!
//! - each child pointer sits behind its own `parking_lot::Mutex`. Inserts
//!   lock-couple down the tree: lock one edge, re-check it, release, descend.
//!   Inserts only ever fill empty edges, so unrelated inserts proceed
//!   concurrently.
//! - a `RwLock<()>` structure guard. Inserts and readers share it. Removal
//!   searches under the upgradable mode, which still admits inserts, and
//!   upgrades to exclusive only for the pointer surgery. Rebuilds take it
//!   exclusively.
//!
//! Depth stays logarithmic the scapegoat way: a node linked deeper than
//! `log_{3/2}(len)` rebuilds its lowest weight-unbalanced ancestor into a
//! perfectly balanced subtree, and the whole tree is rebuilt once removals
//! shrink it below two thirds of its peak size. No walk recurses on tree
//! depth.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use tokio::time::Instant;

use crate::core::pipeline::{PipelineSchedule, Step};
use crate::core::BrokerError;
use crate::util::serde::{Endpoint, PipelineId};

/// Shared handle to a tree node. Identity (not key) names a node.
pub type NodeRef = Arc<TreeNode>;

type Slot = Mutex<Option<NodeRef>>;

/// Position in the tree order: fire time first, then link sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    at: Instant,
    seq: u64,
}

/// A tree node holding one admitted pipeline.
pub struct TreeNode {
    id: PipelineId,
    order: Mutex<OrderKey>,
    schedule: Mutex<PipelineSchedule>,
    left: Slot,
    right: Slot,
}

impl TreeNode {
    fn new(schedule: PipelineSchedule) -> Result<NodeRef, BrokerError> {
        let at = schedule.next_fire_time().ok_or(BrokerError::EmptyPipeline)?;
        Ok(Arc::new(Self {
            id: schedule.id(),
            order: Mutex::new(OrderKey { at, seq: 0 }),
            schedule: Mutex::new(schedule),
            left: Mutex::new(None),
            right: Mutex::new(None),
        }))
    }

    /// Identifier of the pipeline held by this node.
    pub const fn id(&self) -> PipelineId {
        self.id
    }

    /// Fire time of the pipeline's next undispatched step.
    pub fn key(&self) -> Instant {
        self.order.lock().at
    }

    fn order(&self) -> OrderKey {
        *self.order.lock()
    }

    /// Number of steps not yet popped.
    pub fn remaining_steps(&self) -> usize {
        self.schedule.lock().len()
    }

    /// True once the last step has been popped.
    pub fn is_exhausted(&self) -> bool {
        self.schedule.lock().is_empty()
    }

    /// Final receiver of the pipeline.
    pub fn receiver(&self) -> Endpoint {
        self.schedule.lock().receiver().clone()
    }

    /// Admission time plus the pipeline's budget.
    pub fn deadline(&self) -> Instant {
        self.schedule.lock().deadline()
    }
}

impl std::fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeNode")
            .field("id", &self.id)
            .field("key", &self.key())
            .finish_non_exhaustive()
    }
}

/// Outcome of [`ScheduleTree::insert`].
#[derive(Debug, Clone)]
pub struct Insertion {
    /// The freshly linked node.
    pub node: NodeRef,
    /// True when the node went in on the left spine, so it may be the new
    /// leftmost node.
    pub minimum_changed: bool,
}

/// Outcome of [`ScheduleTree::pop_update`].
#[derive(Debug)]
pub struct Popped {
    /// The step that became due.
    pub step: Step,
    /// Final receiver of the pipeline.
    pub receiver: Endpoint,
    /// True when the node was reinserted with further steps.
    pub has_more: bool,
}

/// Where a link walk ended.
struct LinkPath {
    left_spine: bool,
    depth: usize,
}

/// Owner of the slot a node hangs from.
enum Parent {
    Root,
    Left(NodeRef),
    Right(NodeRef),
}

impl Parent {
    fn slot<'a>(&'a self, tree: &'a ScheduleTree) -> &'a Slot {
        match self {
            Self::Root => &tree.root,
            Self::Left(node) => &node.left,
            Self::Right(node) => &node.right,
        }
    }

    fn toward(node: NodeRef, order: OrderKey) -> Self {
        if order < node.order() {
            Self::Left(node)
        } else {
            Self::Right(node)
        }
    }
}

/// Concurrent time-ordered tree of pipelines.
pub struct ScheduleTree {
    root: Slot,
    structure: RwLock<()>,
    len: AtomicUsize,
    /// Largest `len` since the last whole-tree rebuild.
    peak: AtomicUsize,
    next_seq: AtomicU64,
}

impl Default for ScheduleTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleTree {
    /// Create an empty tree.
    pub const fn new() -> Self {
        Self {
            root: Mutex::new(None),
            structure: RwLock::new(()),
            len: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Number of linked nodes.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// True when no pipeline is scheduled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a fresh node holding `schedule`.
    ///
    /// Earlier fire times go left. Equal fire times are ordered by link
    /// sequence, so they keep submission order.
    ///
    /// # Errors
    ///
    /// [`BrokerError::EmptyPipeline`] if `schedule` has no steps left.
    pub fn insert(&self, schedule: PipelineSchedule) -> Result<Insertion, BrokerError> {
        let node = TreeNode::new(schedule)?;
        let minimum_changed = self.attach(&node);
        Ok(Insertion {
            node,
            minimum_changed,
        })
    }

    /// Unlink `node` by identity. Returns false (and changes nothing) if it is
    /// not in the tree, so repeated removals are harmless.
    pub fn remove(&self, node: &NodeRef) -> bool {
        let search = self.structure.upgradable_read();
        let Some(parent) = self.find(node) else {
            return false;
        };
        let _exclusive = RwLockUpgradableReadGuard::upgrade(search);

        let replacement = splice(node);
        *parent.slot(self).lock() = replacement;
        let len = self.len.fetch_sub(1, Ordering::AcqRel) - 1;
        if len * 3 < self.peak.load(Ordering::Acquire) * 2 {
            rebuild(&self.root);
            self.peak.store(len, Ordering::Release);
        }
        true
    }

    /// Pop the node's due step. A node with steps left is reinserted under its
    /// new key; an exhausted node stays out of the tree.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotScheduled`] if the node is not linked.
    pub fn pop_update(&self, node: &NodeRef) -> Result<Popped, BrokerError> {
        if !self.remove(node) {
            return Err(BrokerError::NotScheduled(node.id()));
        }

        let (step, has_more, receiver, next_key) = {
            let mut schedule = node.schedule.lock();
            let (step, has_more) = schedule.pop_next_step()?;
            (
                step,
                has_more,
                schedule.receiver().clone(),
                schedule.next_fire_time(),
            )
        };

        if let Some(next_key) = next_key {
            node.order.lock().at = next_key;
            self.attach(node);
        }

        Ok(Popped {
            step,
            receiver,
            has_more,
        })
    }

    /// Node with the minimum key, found by walking the left spine.
    pub fn leftmost(&self) -> Option<NodeRef> {
        let _shared = self.structure.read();
        let mut current = self.root.lock().clone()?;
        loop {
            let next = current.left.lock().clone();
            match next {
                Some(child) => current = child,
                None => return Some(current),
            }
        }
    }

    /// In-order snapshot of `(pipeline, key)` pairs.
    pub fn snapshot(&self) -> Vec<(PipelineId, Instant)> {
        let _shared = self.structure.read();
        let mut out = Vec::with_capacity(self.len());
        let mut stack: Vec<NodeRef> = Vec::new();
        let mut current = self.root.lock().clone();
        loop {
            while let Some(node) = current {
                current = node.left.lock().clone();
                stack.push(node);
            }
            let Some(node) = stack.pop() else {
                return out;
            };
            out.push((node.id(), node.key()));
            current = node.right.lock().clone();
        }
    }

    /// Number of nodes on the path from the root to the leftmost node.
    pub fn left_spine_depth(&self) -> usize {
        let _shared = self.structure.read();
        let mut depth = 0;
        let mut current = self.root.lock().clone();
        while let Some(node) = current {
            depth += 1;
            current = node.left.lock().clone();
        }
        depth
    }

    /// Number of nodes on the longest root-to-leaf path.
    pub fn height(&self) -> usize {
        let _shared = self.structure.read();
        let mut height = 0;
        let mut stack: Vec<(NodeRef, usize)> = Vec::new();
        stack.extend(self.root.lock().clone().map(|root| (root, 1)));
        while let Some((node, depth)) = stack.pop() {
            height = height.max(depth);
            stack.extend(node.left.lock().clone().map(|child| (child, depth + 1)));
            stack.extend(node.right.lock().clone().map(|child| (child, depth + 1)));
        }
        height
    }

    /// Link `node` and restore the depth bound. Returns true if it went in on
    /// the left spine.
    fn attach(&self, node: &NodeRef) -> bool {
        let path = {
            let _shared = self.structure.read();
            self.link(node)
        };
        if path.depth > depth_limit(self.len()) {
            self.rebalance_above(node);
        }
        path.left_spine
    }

    /// Stamp `node` with the next link sequence and hang it from the first
    /// free slot along its search path. Caller holds the structure guard.
    fn link(&self, node: &NodeRef) -> LinkPath {
        let order = {
            let mut order = node.order.lock();
            order.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            *order
        };

        let mut parent = Parent::Root;
        let mut left_spine = true;
        let mut depth = 0;
        loop {
            let next = {
                let mut edge = parent.slot(self).lock();
                match edge.as_ref() {
                    Some(child) => Arc::clone(child),
                    None => {
                        *edge = Some(Arc::clone(node));
                        break;
                    }
                }
            };
            depth += 1;
            parent = Parent::toward(next, order);
            left_spine &= matches!(parent, Parent::Left(_));
        }

        let len = self.len.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(len, Ordering::AcqRel);
        LinkPath { left_spine, depth }
    }

    /// Parent of `target`, found by key then matched by identity.
    fn find(&self, target: &NodeRef) -> Option<Parent> {
        let order = target.order();
        let mut parent = Parent::Root;
        loop {
            let current = parent.slot(self).lock().clone()?;
            if Arc::ptr_eq(&current, target) {
                return Some(parent);
            }
            parent = Parent::toward(current, order);
        }
    }

    /// Every node from the root down to `target`, each with its parent.
    fn path_to(&self, target: &NodeRef) -> Option<Vec<(Parent, NodeRef)>> {
        let order = target.order();
        let mut path = Vec::new();
        let mut parent = Parent::Root;
        loop {
            let current = parent.slot(self).lock().clone()?;
            let found = Arc::ptr_eq(&current, target);
            let next = Parent::toward(Arc::clone(&current), order);
            path.push((parent, current));
            if found {
                return Some(path);
            }
            parent = next;
        }
    }

    /// Rebuild the lowest ancestor of `node` whose heavier child holds more
    /// than two thirds of its weight, or the whole tree if none does.
    fn rebalance_above(&self, node: &NodeRef) {
        let _exclusive = self.structure.write();
        let Some(path) = self.path_to(node) else {
            return;
        };
        if path.len() - 1 <= depth_limit(self.len()) {
            return;
        }

        let mut size = subtree_size(Some(Arc::clone(node)));
        for pair in path.windows(2).rev() {
            let (ancestor_parent, ancestor) = &pair[0];
            let child = &pair[1].1;
            let left = ancestor.left.lock().clone();
            let right = ancestor.right.lock().clone();
            let sibling = if left.as_ref().is_some_and(|l| Arc::ptr_eq(l, child)) {
                right
            } else {
                left
            };
            let ancestor_size = size + 1 + subtree_size(sibling);
            if size * 3 > ancestor_size * 2 {
                rebuild(ancestor_parent.slot(self));
                return;
            }
            size = ancestor_size;
        }
        rebuild(&self.root);
        self.peak.store(self.len(), Ordering::Release);
    }
}

impl Drop for ScheduleTree {
    fn drop(&mut self) {
        let mut stack: Vec<NodeRef> = self.root.get_mut().take().into_iter().collect();
        while let Some(node) = stack.pop() {
            stack.extend(node.left.lock().take());
            stack.extend(node.right.lock().take());
        }
    }
}

/// Largest `k` with `1.5^k <= len`, in 16-bit fixed point.
fn depth_limit(len: usize) -> usize {
    let target = (len as u128) << 16;
    let mut reach: u128 = 1 << 16;
    let mut limit = 0;
    while reach * 3 / 2 <= target {
        reach = reach * 3 / 2;
        limit += 1;
    }
    limit
}

fn subtree_size(root: Option<NodeRef>) -> usize {
    let mut stack: Vec<NodeRef> = root.into_iter().collect();
    let mut size = 0;
    while let Some(node) = stack.pop() {
        size += 1;
        stack.extend(node.left.lock().clone());
        stack.extend(node.right.lock().clone());
    }
    size
}

/// Replace the subtree hanging from `slot` with a balanced one holding the
/// same nodes in the same order.
fn rebuild(slot: &Slot) {
    let mut nodes = Vec::new();
    let mut stack: Vec<NodeRef> = Vec::new();
    let mut current = slot.lock().take();
    loop {
        while let Some(node) = current {
            current = node.left.lock().take();
            stack.push(node);
        }
        let Some(node) = stack.pop() else {
            break;
        };
        current = node.right.lock().take();
        nodes.push(node);
    }
    *slot.lock() = build_balanced(&nodes);
}

/// Recursion depth is `log2(nodes.len())`.
fn build_balanced(nodes: &[NodeRef]) -> Option<NodeRef> {
    if nodes.is_empty() {
        return None;
    }
    let mid = nodes.len() / 2;
    let root = Arc::clone(&nodes[mid]);
    *root.left.lock() = build_balanced(&nodes[..mid]);
    *root.right.lock() = build_balanced(&nodes[mid + 1..]);
    Some(root)
}

/// Detach `node`'s children and return the subtree that takes its place.
fn splice(node: &NodeRef) -> Option<NodeRef> {
    let left = node.left.lock().take();
    let right = node.right.lock().take();
    match (left, right) {
        (None, None) => None,
        (Some(child), None) | (None, Some(child)) => Some(child),
        (Some(left), Some(right)) => {
            let successor = match detach_leftmost(&right) {
                Some(leftmost) => {
                    *leftmost.right.lock() = Some(right);
                    leftmost
                }
                None => right,
            };
            *successor.left.lock() = Some(left);
            Some(successor)
        }
    }
}

/// Remove the leftmost node strictly below `subtree`, handing its right child to
/// its parent. `None` when `subtree` has no left child.
fn detach_leftmost(subtree: &NodeRef) -> Option<NodeRef> {
    let mut parent = Arc::clone(subtree);
    loop {
        let child = parent.left.lock().clone()?;
        let has_left = child.left.lock().is_some();
        if !has_left {
            let orphan = child.right.lock().take();
            *parent.left.lock() = orphan;
            return Some(child);
        }
        parent = child;
    }
}
