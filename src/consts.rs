/// Length given to branches that have none yet (fresh stubs, unlabelled Newick).
pub const DEFAULT_BRANCH_LENGTH: f64 = 0.1;

/// Floor for optimised branch lengths.
pub const MIN_BRANCH_LENGTH: f64 = 1e-6;

/// Sentinel score of an empty set or an unscored tree. Finite so it survives JSON.
pub const WORST_SCORE: f64 = f64::MIN;

/// Depth of the neighbourhood re-evaluated around applied moves under speed NNI.
pub const SPEED_NNI_RADIUS: usize = 2;

/// Progress is logged every this many iterations.
pub const PROGRESS_INTERVAL: usize = 10;

/// Remaining-time estimates are printed only past this iteration.
pub const ESTIMATE_AFTER_ITERATION: usize = 20;

/// Starting trees that collide with an existing one get this many random NNIs.
pub const DUPLICATE_RANDOM_NNIS: usize = 3;
