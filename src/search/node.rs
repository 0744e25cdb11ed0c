use crate::Prob;
use crate::Value;
use std::cell::UnsafeCell;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// lifecycle of a node. the byte doubles as the node's exclusive lock:
/// winning the Unexpanded -> Expanding transition grants sole ownership
/// of the children array until the release store of Expanded/Terminal
/// publishes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unexpanded = 0,
    Expanding = 1,
    Expanded = 2,
    Terminal = 3,
}

impl From<u8> for State {
    fn from(n: u8) -> State {
        match n {
            0 => State::Unexpanded,
            1 => State::Expanding,
            2 => State::Expanded,
            3 => State::Terminal,
            _ => panic!("invalid node state"),
        }
    }
}

/// what a descending worker found at a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// this worker won the expansion claim and must publish, resolve,
    /// or abort before returning
    Claimed,
    Expanded,
    Terminal,
}

/// one visited board in the search tree. a node exclusively owns its
/// children; concurrent workers descend by shared borrow and communicate
/// through the atomics. `value_sum` accumulates leaf evaluations in the
/// perspective of the side to move at this node.
pub struct Node<M> {
    mv: Option<M>,
    prior: Prob,
    state: AtomicU8,
    visits: AtomicU32,
    value_sum: AtomicU64,
    virtual_loss: AtomicU32,
    children: UnsafeCell<Vec<Node<M>>>,
    resolved: UnsafeCell<Value>,
}

// children and resolved are written only by the thread holding the
// Expanding claim and published by the release store of the state byte;
// readers only dereference them after an acquire load observes
// Expanded/Terminal. everything else is atomic.
unsafe impl<M: Send> Send for Node<M> {}
unsafe impl<M: Send + Sync> Sync for Node<M> {}

impl<M: Copy> Node<M> {
    /// the sentinel at the top of the tree
    pub fn root() -> Self {
        Self::new(None, 1.0)
    }

    pub fn child(mv: M, prior: Prob) -> Self {
        Self::new(Some(mv), prior)
    }

    fn new(mv: Option<M>, prior: Prob) -> Self {
        Self {
            mv,
            prior,
            state: AtomicU8::new(State::Unexpanded as u8),
            visits: AtomicU32::new(0),
            value_sum: AtomicU64::new(0f64.to_bits()),
            virtual_loss: AtomicU32::new(0),
            children: UnsafeCell::new(Vec::new()),
            resolved: UnsafeCell::new(0.5),
        }
    }

    pub fn edge(&self) -> Option<M> {
        self.mv
    }
    pub fn prior(&self) -> Prob {
        self.prior
    }
    pub fn visits(&self) -> u32 {
        self.visits.load(Ordering::Relaxed)
    }
    pub fn value_sum(&self) -> f64 {
        f64::from_bits(self.value_sum.load(Ordering::Relaxed))
    }
    pub fn state(&self) -> State {
        self.state.load(Ordering::Acquire).into()
    }

    /// the frozen children, or nothing while the node is still a leaf
    pub fn children(&self) -> &[Node<M>] {
        match self.state() {
            State::Expanded | State::Terminal => unsafe { &*self.children.get() },
            State::Unexpanded | State::Expanding => &[],
        }
    }

    /// nodes in this subtree, counting self
    pub fn size(&self) -> usize {
        1 + self.children().iter().map(Node::size).sum::<usize>()
    }

    /// resolve the node's phase for a descent, yielding to the scheduler
    /// while another worker holds the expansion claim
    pub fn probe(&self) -> Probe {
        loop {
            match self.state.load(Ordering::Acquire).into() {
                State::Unexpanded => {
                    if self
                        .state
                        .compare_exchange(
                            State::Unexpanded as u8,
                            State::Expanding as u8,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        return Probe::Claimed;
                    }
                }
                State::Expanding => std::thread::yield_now(),
                State::Expanded => return Probe::Expanded,
                State::Terminal => return Probe::Terminal,
            }
        }
    }

    /// publish the children and release the expansion claim. the shape
    /// of the array never changes afterwards.
    pub fn publish(&self, children: Vec<Node<M>>) {
        unsafe { *self.children.get() = children };
        self.state.store(State::Expanded as u8, Ordering::Release);
    }

    /// freeze the node with a game-end (or tree-ceiling) value
    pub fn resolve(&self, value: Value) {
        unsafe { *self.resolved.get() = value };
        self.state.store(State::Terminal as u8, Ordering::Release);
    }

    /// release a failed expansion claim so another worker can retry
    pub fn retract(&self) {
        self.state.store(State::Unexpanded as u8, Ordering::Release);
    }

    /// the frozen value of a Terminal node
    pub fn resolved_value(&self) -> Value {
        debug_assert!(self.state() == State::Terminal);
        unsafe { *self.resolved.get() }
    }

    /// realized mean outcome for the player who moves into this node
    pub fn expectation(&self) -> Value {
        let visits = self.visits();
        match visits {
            0 => 0.0,
            v => ((v as f64 - self.value_sum()) / v as f64) as f32,
        }
    }

    /// PUCT. Q is the selecting player's mean outcome with the virtual
    /// losses inflating only the denominator; U scales the prior by the
    /// parent's visit mass. ties go to the earlier child.
    pub fn select_child(&self, exploration: f32) -> Option<&Node<M>> {
        let sqrt_parent = (self.visits() as f32).sqrt();
        let mut best: Option<(&Node<M>, f32)> = None;
        for child in self.children() {
            let visits = child.visits();
            let losses = child.virtual_loss.load(Ordering::Relaxed);
            let denom = (visits + losses) as f32;
            let q = match denom {
                d if d == 0.0 => 0.0,
                d => ((visits as f64 - child.value_sum()) / d as f64) as f32,
            };
            let u = exploration * child.prior * sqrt_parent / (1.0 + denom);
            let score = q + u;
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((child, score));
            }
        }
        best.map(|(child, _)| child)
    }

    pub fn add_virtual_loss(&self, magnitude: u32) {
        self.virtual_loss.fetch_add(magnitude, Ordering::Relaxed);
    }
    pub fn remove_virtual_loss(&self, magnitude: u32) {
        self.virtual_loss.fetch_sub(magnitude, Ordering::Relaxed);
    }

    /// back-propagate one evaluation, given in this node's own
    /// side-to-move perspective
    pub fn update(&self, value: Value) {
        self.value_sum
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value as f64).to_bits())
            })
            .expect("value accumulation never aborts");
        self.visits.fetch_add(1, Ordering::Relaxed);
    }

    /// detach the subtree behind the given move, consuming the rest of
    /// the tree. lets a think inherit the pondered continuation.
    pub fn promote(self, mv: M) -> Option<Node<M>>
    where
        M: PartialEq,
    {
        match State::from(self.state.load(Ordering::Acquire)) {
            State::Expanded => {
                let mut children = self.children.into_inner();
                children
                    .iter()
                    .position(|child| child.mv == Some(mv))
                    .map(|i| children.swap_remove(i))
            }
            _ => None,
        }
    }
}

impl<M: Copy + std::fmt::Display> std::fmt::Display for Node<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.mv {
            Some(mv) => write!(
                f,
                "{:>8} {:>9} visits {:.3} mean {:.3} prior",
                mv.to_string(),
                self.visits(),
                self.expectation(),
                self.prior()
            ),
            None => write!(f, "    root {:>9} visits", self.visits()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn visited(mv: char, prior: Prob, visits: usize, mean: Value) -> Node<char> {
        let node = Node::child(mv, prior);
        for _ in 0..visits {
            node.update(mean);
        }
        node
    }

    fn parent(children: Vec<Node<char>>, visits: usize) -> Node<char> {
        let node = Node::root();
        assert!(node.probe() == Probe::Claimed);
        node.publish(children);
        for _ in 0..visits {
            node.update(0.5);
        }
        node
    }

    #[test]
    fn puct_prefers_the_better_child() {
        let node = parent(
            vec![visited('a', 0.6, 40, 0.6), visited('b', 0.4, 60, 0.55)],
            100,
        );
        assert!(node.select_child(1.0).unwrap().edge() == Some('a'));
    }

    #[test]
    fn puct_follows_the_prior_when_flipped() {
        let node = parent(
            vec![visited('a', 0.4, 40, 0.6), visited('b', 0.6, 60, 0.55)],
            100,
        );
        assert!(node.select_child(1.0).unwrap().edge() == Some('b'));
    }

    #[test]
    fn ties_break_towards_the_earlier_child() {
        let node = parent(vec![Node::child('a', 0.5), Node::child('b', 0.5)], 0);
        assert!(node.select_child(1.0).unwrap().edge() == Some('a'));
    }

    #[test]
    fn virtual_loss_discourages_the_busy_path() {
        let node = parent(
            vec![visited('a', 0.5, 10, 0.5), visited('b', 0.5, 10, 0.5)],
            20,
        );
        assert!(node.select_child(1.0).unwrap().edge() == Some('a'));
        node.children()[0].add_virtual_loss(3);
        assert!(node.select_child(1.0).unwrap().edge() == Some('b'));
        node.children()[0].remove_virtual_loss(3);
        assert!(node.select_child(1.0).unwrap().edge() == Some('a'));
    }

    #[test]
    fn updates_accumulate_within_bounds() {
        let node = Node::child('a', 1.0);
        for _ in 0..1000 {
            node.update(0.7);
        }
        assert!(node.visits() == 1000);
        assert!((node.value_sum() - 700.0).abs() < 1e-6);
        assert!(node.value_sum().abs() <= node.visits() as f64);
    }

    #[test]
    fn leaves_have_no_children() {
        let node = Node::<char>::root();
        assert!(node.children().is_empty());
        assert!(node.state() == State::Unexpanded);
        assert!(node.size() == 1);
    }

    #[test]
    fn retract_reopens_the_claim() {
        let node = Node::<char>::root();
        assert!(node.probe() == Probe::Claimed);
        node.retract();
        assert!(node.probe() == Probe::Claimed);
    }

    #[test]
    fn promote_detaches_the_chosen_subtree() {
        let node = parent(vec![visited('a', 0.5, 3, 0.5), visited('b', 0.5, 7, 0.5)], 10);
        let subtree = node.promote('b').unwrap();
        assert!(subtree.edge() == Some('b'));
        assert!(subtree.visits() == 7);
    }

    #[test]
    fn promote_of_a_leaf_is_nothing() {
        let node = Node::root();
        assert!(node.promote('a').is_none());
    }

    /// sixteen workers hammer a fresh root: exactly one wins the claim,
    /// everyone else blocks until the children appear
    #[test]
    fn expansion_is_single_flight() {
        let node = Node::<char>::root();
        let claims = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| match node.probe() {
                    Probe::Claimed => {
                        claims.fetch_add(1, Ordering::Relaxed);
                        std::thread::sleep(std::time::Duration::from_millis(1));
                        node.publish(vec![Node::child('a', 1.0)]);
                        node.update(0.5);
                    }
                    Probe::Expanded => node.update(0.5),
                    Probe::Terminal => panic!("nobody resolved this node"),
                });
            }
        });
        assert!(claims.load(Ordering::Relaxed) == 1);
        assert!(node.children().len() == 1);
        assert!(node.visits() == 16);
        assert!(node.state() == State::Expanded);
    }

    #[test]
    fn terminal_nodes_keep_their_value() {
        let node = Node::<char>::root();
        assert!(node.probe() == Probe::Claimed);
        node.resolve(0.0);
        assert!(node.probe() == Probe::Terminal);
        assert!(node.resolved_value() == 0.0);
        assert!(node.children().is_empty());
    }
}
