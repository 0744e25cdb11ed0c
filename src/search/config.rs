/// search tuning knobs. `Default` is tournament-reasonable; front ends
/// overwrite whatever their protocol exposes.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// simulations per think, 0 for unlimited
    pub playout_limit: usize,
    /// wall clock per think in milliseconds, 0 for unlimited
    pub time_limit_ms: u64,
    /// worker threads descending the tree
    pub num_threads: usize,
    /// exploration constant in the PUCT term
    pub c_puct: f32,
    /// policy softmax temperature
    pub softmax_temperature: f32,
    /// virtual loss added per in-flight descent through a node
    pub virtual_loss: u32,
    /// ceiling on total tree nodes; the tree freezes past it
    pub max_tree_nodes: usize,
    /// one accelerator audit per this many evaluations
    pub self_check_probability: u32,
    pub quiet: bool,
    pub analyze: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            playout_limit: 0,
            time_limit_ms: 0,
            num_threads: num_cpus::get(),
            c_puct: 1.0,
            softmax_temperature: 1.0,
            virtual_loss: 3,
            max_tree_nodes: 40_000_000,
            self_check_probability: 2000,
            quiet: false,
            analyze: false,
        }
    }
}
