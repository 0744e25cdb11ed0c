use super::config::SearchConfig;
use super::node::Node;
use super::node::Probe;
use super::position::Position;
use crate::ANALYZE_LOG_INTERVAL;
use crate::BUDGET_POLL_INTERVAL;
use crate::Prob;
use crate::Value;
use crate::nn::error::EvaluatorError;
use crate::nn::network::NetworkOutput;
use crate::nn::planes::Plane;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// evaluator plug-in: feature planes in, a softmaxed move distribution
/// over the flat encoding and a winrate in [-1, 1] out. implementations
/// must tolerate concurrent calls from every worker thread.
pub trait Oracle: Send + Sync {
    fn evaluate(&self, planes: &[Plane]) -> Result<NetworkOutput, EvaluatorError>;
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Evaluator(#[from] EvaluatorError),
    #[error("no legal moves at the search root")]
    NoMoves,
}

/// what a think settles on: the move, its expected outcome for the side
/// to move, and the tree it grew (kept around so the chosen subtree can
/// be promoted into the next think or ponder)
pub struct Decision<M> {
    pub mv: M,
    pub value: Value,
    pub playouts: usize,
    pub pv: Vec<M>,
    pub root: Node<M>,
}

/// cooperative cancellation for think and ponder
#[derive(Clone)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// shared accounting for one think/ponder call
struct Context {
    /// simulations allowed, 0 for unlimited
    limit: usize,
    /// node ceiling; the tree freezes at the frontier past it
    ceiling: usize,
    deadline: Option<Instant>,
    playouts: AtomicUsize,
    nodes: AtomicUsize,
    running: AtomicBool,
    failure: Mutex<Option<EvaluatorError>>,
}

impl Context {
    fn new(limit: usize, deadline: Option<Instant>, ceiling: usize, seeded: usize) -> Self {
        Self {
            limit,
            ceiling: ceiling.max(1),
            deadline,
            playouts: AtomicUsize::new(0),
            nodes: AtomicUsize::new(seeded),
            running: AtomicBool::new(true),
            failure: Mutex::new(None),
        }
    }

    /// whether a worker may start another simulation
    fn keep_going(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && (self.limit == 0 || self.playouts.load(Ordering::Relaxed) < self.limit)
            && self.nodes.load(Ordering::Relaxed) < self.ceiling
    }

    fn halt(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn fail(&self, error: EvaluatorError) {
        let mut slot = self.failure.lock().expect("failure slot");
        slot.get_or_insert(error);
        self.halt();
    }
}

/// the UCT driver. owns nothing but configuration; the oracle is
/// borrowed, the tree lives for the duration of one call and is handed
/// back to the caller inside the Decision.
pub struct Search<'a, O> {
    oracle: &'a O,
    config: SearchConfig,
    stop: Arc<AtomicBool>,
}

impl<'a, O: Oracle> Search<'a, O> {
    pub fn new(oracle: &'a O, config: SearchConfig) -> Self {
        Self {
            oracle,
            config,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(self.stop.clone())
    }

    /// grow a tree under the configured budget and settle on a move.
    /// `reuse` carries a subtree promoted from a previous call.
    pub fn think<P: Position>(
        &self,
        position: &P,
        reuse: Option<Node<P::Move>>,
    ) -> Result<Decision<P::Move>, SearchError> {
        self.stop.store(false, Ordering::Release);
        let root = reuse.unwrap_or_else(Node::root);
        let deadline = match self.config.time_limit_ms {
            0 => None,
            ms => Some(Instant::now() + Duration::from_millis(ms)),
        };
        let context = Context::new(
            self.config.playout_limit,
            deadline,
            self.config.max_tree_nodes,
            root.size(),
        );
        self.run(&root, position, &context);
        let failure = context.failure.lock().expect("failure slot").take();
        match failure {
            Some(error) if favorite(&root).is_none() => Err(SearchError::Evaluator(error)),
            Some(error) => {
                log::warn!("search stopped early: {}", error);
                self.decide(root, &context)
            }
            None => self.decide(root, &context),
        }
    }

    /// think without a budget: runs until the abort handle fires, then
    /// hands the grown tree back for reuse
    pub fn ponder<P: Position>(
        &self,
        position: &P,
        reuse: Option<Node<P::Move>>,
    ) -> Result<Node<P::Move>, SearchError> {
        self.stop.store(false, Ordering::Release);
        let root = reuse.unwrap_or_else(Node::root);
        let context = Context::new(0, None, self.config.max_tree_nodes, root.size());
        self.run(&root, position, &context);
        match context.failure.lock().expect("failure slot").take() {
            Some(error) => Err(SearchError::Evaluator(error)),
            None => Ok(root),
        }
    }

    /// fixed worker pool against the shared tree, with the calling
    /// thread watching the clock
    fn run<P: Position>(&self, root: &Node<P::Move>, position: &P, context: &Context) {
        let workers = self.config.num_threads.max(1);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| self.worker(root, position, context));
            }
            self.monitor(root, context);
        });
    }

    fn worker<P: Position>(&self, root: &Node<P::Move>, position: &P, context: &Context) {
        let mut position = position.clone();
        while context.keep_going() {
            match self.simulate(&mut position, root, context) {
                Ok(_) => {
                    context.playouts.fetch_add(1, Ordering::Relaxed);
                }
                Err(error) => {
                    context.fail(error);
                    break;
                }
            }
        }
    }

    fn monitor<M: Copy + std::fmt::Display>(&self, root: &Node<M>, context: &Context) {
        let mut reported = Instant::now();
        while context.keep_going() {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            if context.deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            if self.config.analyze
                && !self.config.quiet
                && reported.elapsed() >= ANALYZE_LOG_INTERVAL
            {
                dump_stats(root);
                reported = Instant::now();
            }
            std::thread::sleep(BUDGET_POLL_INTERVAL);
        }
        context.halt();
    }

    /// one playout: descend by PUCT under virtual loss, expand the leaf,
    /// back-propagate with the perspective flipping each ply. returns the
    /// value from `node`'s own side to move.
    fn simulate<P: Position>(
        &self,
        position: &mut P,
        node: &Node<P::Move>,
        context: &Context,
    ) -> Result<Value, EvaluatorError> {
        let value = match node.probe() {
            Probe::Claimed => self.expand(position, node, context)?,
            Probe::Terminal => node.resolved_value(),
            Probe::Expanded => {
                let child = node
                    .select_child(self.config.c_puct)
                    .expect("expanded nodes have children");
                child.add_virtual_loss(self.config.virtual_loss);
                position.apply(child.edge().expect("children carry moves"));
                let result = self.simulate(position, child, context);
                position.undo();
                child.remove_virtual_loss(self.config.virtual_loss);
                1.0 - result?
            }
        };
        node.update(value);
        Ok(value)
    }

    /// evaluate a claimed leaf and publish its children. priors come
    /// from the oracle's distribution at each legal move's policy index,
    /// renormalized over the legal set.
    fn expand<P: Position>(
        &self,
        position: &P,
        node: &Node<P::Move>,
        context: &Context,
    ) -> Result<Value, EvaluatorError> {
        if let Some(value) = position.terminal_value() {
            node.resolve(value);
            return Ok(value);
        }
        let planes = position.input_planes();
        let output = match self.oracle.evaluate(&planes) {
            Ok(output) => output,
            Err(error) => {
                node.retract();
                return Err(error);
            }
        };
        let value = (output.winrate + 1.0) / 2.0;
        let moves = position.legal_moves();
        if moves.is_empty() {
            // the collaborator promised a terminal_value here; score a
            // dead position as a draw rather than crash mid-search
            node.resolve(0.5);
            return Ok(0.5);
        }
        let grown = context.nodes.fetch_add(moves.len(), Ordering::Relaxed) + moves.len();
        if grown > context.ceiling {
            // ceiling reached: freeze the frontier, keep the evaluation
            context.nodes.fetch_sub(moves.len(), Ordering::Relaxed);
            node.resolve(value);
            return Ok(value);
        }
        let mut priors = moves
            .iter()
            .map(|&mv| position.policy_index(mv))
            .map(|index| output.policy.get(index).copied().unwrap_or(0.0))
            .collect::<Vec<Prob>>();
        let mass = priors.iter().sum::<f32>();
        match mass {
            m if m > f32::EPSILON => priors.iter_mut().for_each(|p| *p /= m),
            _ => priors.fill(1.0 / moves.len() as f32),
        }
        node.publish(
            moves
                .into_iter()
                .zip(priors)
                .map(|(mv, prior)| Node::child(mv, prior))
                .collect(),
        );
        Ok(value)
    }

    fn decide<M: Copy + PartialEq + std::fmt::Display>(
        &self,
        root: Node<M>,
        context: &Context,
    ) -> Result<Decision<M>, SearchError> {
        let pv = principal_variation(&root);
        let (mv, value) = {
            let best = favorite(&root).ok_or(SearchError::NoMoves)?;
            (best.edge().expect("children carry moves"), best.expectation())
        };
        if !self.config.quiet {
            log::info!(
                "{} ({:.1}%) after {} playouts over {} nodes",
                mv,
                100.0 * value,
                context.playouts.load(Ordering::Relaxed),
                context.nodes.load(Ordering::Relaxed),
            );
        }
        Ok(Decision {
            mv,
            value,
            playouts: context.playouts.load(Ordering::Relaxed),
            pv,
            root,
        })
    }
}

/// the root child the search stands behind: most visits, then realized
/// outcome, then move order
pub fn favorite<M: Copy>(node: &Node<M>) -> Option<&Node<M>> {
    node.children().iter().fold(None, |best, child| match best {
        None => Some(child),
        Some(top)
            if child.visits() > top.visits()
                || (child.visits() == top.visits() && child.expectation() > top.expectation()) =>
        {
            Some(child)
        }
        Some(top) => Some(top),
    })
}

/// follow the favorite rule down the tree until the visits run out
pub fn principal_variation<M: Copy>(root: &Node<M>) -> Vec<M> {
    let mut pv = Vec::new();
    let mut node = root;
    while let Some(child) = favorite(node) {
        if child.visits() == 0 {
            break;
        }
        pv.push(child.edge().expect("children carry moves"));
        node = child;
    }
    pv
}

/// read-only snapshot of the root's best lines, safe to call while the
/// workers are still descending: it only reads atomics and published
/// children, so it may see a tree mid-growth but never a torn one
pub fn dump_stats<M: Copy + std::fmt::Display>(root: &Node<M>) {
    let ref mut ranked = root.children().iter().collect::<Vec<_>>();
    ranked.sort_by_key(|child| std::cmp::Reverse(child.visits()));
    for child in ranked.iter().take(5) {
        let line = std::iter::once(child.edge().expect("children carry moves"))
            .chain(principal_variation(child))
            .map(|mv| mv.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        log::info!("{} | {}", child, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// a scripted stand-in for the chess collaborator: a uniform tree
    /// with `fanout` moves per ply, ending in a draw at `depth` plies
    #[derive(Clone)]
    struct Scripted {
        fanout: usize,
        depth: usize,
        path: Vec<u16>,
    }

    impl Scripted {
        fn new(fanout: usize, depth: usize) -> Self {
            Self { fanout, depth, path: Vec::new() }
        }
    }

    impl Position for Scripted {
        type Move = u16;
        fn input_planes(&self) -> Vec<Plane> {
            vec![Plane::empty(); 4]
        }
        fn legal_moves(&self) -> Vec<u16> {
            match self.terminal_value() {
                Some(_) => vec![],
                None => (0..self.fanout as u16).collect(),
            }
        }
        fn apply(&mut self, mv: u16) {
            self.path.push(mv);
        }
        fn undo(&mut self) {
            self.path.pop();
        }
        fn terminal_value(&self) -> Option<Value> {
            (self.path.len() >= self.depth).then_some(0.5)
        }
        fn policy_index(&self, mv: u16) -> usize {
            mv as usize
        }
    }

    /// counts its calls and hands out a fixed distribution
    struct Scripter {
        calls: AtomicUsize,
        policy: Vec<Prob>,
        winrate: f32,
        /// calls allowed before every evaluation errors
        fuse: usize,
    }

    impl Scripter {
        fn uniform(width: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                policy: vec![1.0 / width as f32; width],
                winrate: 0.0,
                fuse: usize::MAX,
            }
        }
        fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl Oracle for Scripter {
        fn evaluate(&self, _: &[Plane]) -> Result<NetworkOutput, EvaluatorError> {
            let calls = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
            if calls > self.fuse {
                return Err(EvaluatorError::Backend("scripted failure".to_string()));
            }
            Ok(NetworkOutput {
                policy: self.policy.clone(),
                winrate: self.winrate,
            })
        }
    }

    fn config(playouts: usize, threads: usize) -> SearchConfig {
        SearchConfig {
            playout_limit: playouts,
            num_threads: threads,
            quiet: true,
            ..SearchConfig::default()
        }
    }

    /// one playout from the start: the root is expanded with every move
    /// at equal prior and no child visited yet
    #[test]
    fn first_playout_expands_the_root() {
        let oracle = Scripter::uniform(32);
        let search = Search::new(&oracle, config(1, 1));
        let decision = search.think(&Scripted::new(20, 8), None).unwrap();
        let root = &decision.root;
        assert!(decision.playouts == 1);
        assert!(root.visits() == 1);
        assert!(root.children().len() == 20);
        for child in root.children() {
            assert!((child.prior() - 0.05).abs() < 1e-6);
            assert!(child.visits() == 0);
        }
    }

    /// single-threaded, with the game too deep to bottom out, the playout
    /// budget maps one-to-one onto evaluator calls and the counter
    #[test]
    fn playouts_account_for_evaluations() {
        let oracle = Scripter::uniform(32);
        let search = Search::new(&oracle, config(25, 1));
        let decision = search.think(&Scripted::new(8, 64), None).unwrap();
        assert!(decision.playouts == 25);
        assert!(decision.root.visits() == 25);
        assert!(oracle.calls() == 25);
    }

    /// terminal hits skip the evaluator but still count as playouts
    #[test]
    fn terminal_hits_skip_the_oracle() {
        let oracle = Scripter::uniform(32);
        let search = Search::new(&oracle, config(10, 1));
        let decision = search.think(&Scripted::new(3, 1), None).unwrap();
        assert!(decision.playouts == 10);
        assert!(oracle.calls() == 1);
    }

    #[test]
    fn search_is_deterministic_single_threaded() {
        let policy = (0..32).map(|i| (32 - i) as f32 / 32.0).collect::<Vec<_>>();
        let oracle = Scripter {
            policy,
            winrate: 0.2,
            ..Scripter::uniform(32)
        };
        let search = Search::new(&oracle, config(50, 1));
        let one = search.think(&Scripted::new(6, 12), None).unwrap();
        let two = search.think(&Scripted::new(6, 12), None).unwrap();
        assert!(one.mv == two.mv);
        assert!(one.pv == two.pv);
        assert!(one.playouts == two.playouts);
    }

    #[test]
    fn workers_share_one_tree() {
        let oracle = Scripter::uniform(32);
        let search = Search::new(&oracle, config(64, 8));
        let decision = search.think(&Scripted::new(5, 10), None).unwrap();
        let root = &decision.root;
        assert!(root.visits() as usize == decision.playouts);
        // every playout after the first descended through exactly one child
        let descents = root.children().iter().map(|c| c.visits()).sum::<u32>();
        assert!(descents == root.visits() - 1);
    }

    /// the node ceiling freezes the frontier but the search keeps
    /// playing out against it
    #[test]
    fn tree_stops_growing_at_the_ceiling() {
        let oracle = Scripter::uniform(32);
        let config = SearchConfig {
            playout_limit: 30,
            num_threads: 1,
            max_tree_nodes: 30,
            quiet: true,
            ..SearchConfig::default()
        };
        let search = Search::new(&oracle, config);
        let decision = search.think(&Scripted::new(20, 10), None).unwrap();
        let root = &decision.root;
        assert!(decision.playouts == 30);
        assert!(root.children().len() == 20);
        for child in root.children() {
            assert!(child.children().is_empty());
        }
    }

    /// the fuse blows on the second evaluation: the root is already
    /// expanded, so the search still stands behind a move
    #[test]
    fn failing_oracle_still_reports_a_searched_root() {
        let broken = Scripter {
            fuse: 1,
            ..Scripter::uniform(32)
        };
        let search = Search::new(&broken, config(10, 1));
        let decision = search.think(&Scripted::new(4, 8), None).unwrap();
        assert!(decision.playouts == 1);
        assert!(decision.root.children().len() == 4);
    }

    /// the fuse blows immediately: nothing was searched, so the failure
    /// surfaces instead of a move
    #[test]
    fn failing_oracle_reports_when_nothing_was_searched() {
        let broken = Scripter {
            fuse: 0,
            ..Scripter::uniform(32)
        };
        let search = Search::new(&broken, config(10, 1));
        let decision = search.think(&Scripted::new(4, 8), None);
        assert!(matches!(decision, Err(SearchError::Evaluator(_))));
    }

    #[test]
    fn ponder_runs_until_aborted() {
        let oracle = Scripter::uniform(32);
        let search = Search::new(&oracle, config(0, 2));
        let handle = search.abort_handle();
        let position = Scripted::new(6, 12);
        std::thread::scope(|s| {
            let pondering = s.spawn(|| search.ponder(&position, None));
            std::thread::sleep(Duration::from_millis(50));
            handle.abort();
            let root = pondering.join().unwrap().unwrap();
            assert!(root.visits() > 0);
        });
    }

    #[test]
    fn promoted_subtrees_seed_the_next_think() {
        let oracle = Scripter::uniform(32);
        let search = Search::new(&oracle, config(40, 1));
        let mut position = Scripted::new(6, 12);
        let decision = search.think(&position, None).unwrap();
        let inherited = decision.root.promote(decision.mv).unwrap();
        let carried = inherited.visits();
        assert!(carried > 0);
        position.apply(decision.mv);
        let second = search.think(&position, Some(inherited)).unwrap();
        assert!(second.root.visits() >= carried);
    }

    #[test]
    fn principal_variation_follows_the_visits() {
        let oracle = Scripter::uniform(32);
        let search = Search::new(&oracle, config(100, 1));
        let decision = search.think(&Scripted::new(4, 8), None).unwrap();
        assert!(!decision.pv.is_empty());
        assert!(decision.pv[0] == decision.mv);
        // the pv is a legal walk: never longer than the game
        assert!(decision.pv.len() <= 8);
    }
}
