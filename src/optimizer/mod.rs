pub mod iqp;
pub mod nni;
pub mod perturbation;
pub mod search;

pub use nni::{MoveEngine, NniOutcome, NniSettings, TabuSet, TreeObserver};
pub use perturbation::PerturbationKind;
pub use search::{SearchContext, StartTree, TreeSearch};
