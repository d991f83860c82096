pub mod backend;
pub mod cluster_state;
pub mod context;
pub mod error;
pub mod normalize;
pub mod planner;
pub mod reconciler;
pub mod state_machine;
pub mod status;

pub use backend::{DatabaseShell, MemberBackend};
pub use cluster_state::{ClusterState, ClusterStateStore, Member};
pub use context::Context;
pub use error::{BackoffConfig, Error, ErrorContext, Result};
pub use normalize::{ClusterSpec, MAX_REPLICAS, MIN_REPLICAS, RestoreSource, SpecDiff, diff, normalize};
pub use planner::{PassInput, PassOutcome, Step, plan, run_pass};
pub use reconciler::{FINALIZER, error_policy, reconcile};
pub use status::{ConditionBuilder, StatusManager, spec_changed};
