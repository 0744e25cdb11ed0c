pub mod nn;
pub mod search;

/// dimensional analysis types
pub type Logit = f32;
pub type Prob = f32;
pub type Value = f32;
pub type Winrate = f32;

// board geometry
pub const BOARD: usize = 8;
pub const SQUARES: usize = BOARD * BOARD;

// batch normalization parameters
pub(crate) const BN_EPSILON: f32 = 1e-5;

// accelerator self-check parameters
pub(crate) const CHECK_MIN_EXPANSIONS: usize = 2_000_000;
pub(crate) const CHECK_RELATIVE_ERROR: f32 = 0.1;
pub(crate) const CHECK_ABSOLUTE_FLOOR: f32 = 1e-3;

// search driver cadence
pub(crate) const ANALYZE_LOG_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
pub(crate) const BUDGET_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);

/// trait for random generation, mainly (strictly?) for testing
pub trait Arbitrary {
    fn random() -> Self;
}

/// initialize logging
pub fn init(quiet: bool) {
    let config = simplelog::ConfigBuilder::new()
        .set_location_level(log::LevelFilter::Off)
        .set_target_level(log::LevelFilter::Off)
        .set_thread_level(log::LevelFilter::Off)
        .build();
    let level = if quiet {
        log::LevelFilter::Warn
    } else {
        log::LevelFilter::Info
    };
    simplelog::TermLogger::init(
        level,
        config,
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )
    .expect("initialize logger");
}
