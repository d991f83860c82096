//! Planning core of the replica set reconciler
//!
//! `plan` is a pure function of the normalized spec, the observed state and a
//! little persisted context. It returns exactly one step per pass; the kube
//! driver executes that step through a `MemberBackend` and requeues. Member
//! changes therefore happen strictly one at a time.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::backup::restore::{RestoreController, is_exhausted, restore_pending};
use crate::controller::backend::MemberBackend;
use crate::controller::cluster_state::{ClusterState, Member, majority_of};
use crate::controller::error::Result;
use crate::controller::normalize::ClusterSpec;
use crate::controller::state_machine::{
    ClusterEvent, ClusterStateMachine, TransitionContext, TransitionResult, determine_event,
};
use crate::crd::{ClusterPhase, RestoreRecord};

/// Requeue after a pass that found nothing to do
pub const STEADY_REQUEUE: Duration = Duration::from_secs(30);
/// Requeue while waiting for members to become healthy
pub const WAIT_REQUEUE: Duration = Duration::from_secs(5);
/// Requeue after a step was executed
pub const STEP_REQUEUE: Duration = Duration::from_secs(2);

/// Persisted context the planner needs besides spec and state
#[derive(Debug, Clone)]
pub struct PlanContext<'a> {
    pub restore: Option<&'a RestoreRecord>,
    /// The client service exists
    pub admitted: bool,
    /// Scaling for the current generation was aborted for quorum safety
    pub quorum_blocked: bool,
    pub now: DateTime<Utc>,
}

/// The single action of a reconcile pass
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    CreateMembers(i32),
    InitiateReplicaSet,
    JoinMember(Member),
    RunRestore,
    /// A failed restore is backing off until the given time
    AwaitRestore {
        until: DateTime<Utc>,
    },
    AddMember,
    StepDown(Member),
    RemoveMember(Member),
    /// Scale-down would leave the remaining set without a healthy majority
    AbortScaling(String),
    RollMember(Member),
    AdmitTraffic,
    Wait(String),
    Noop,
}

impl Step {
    /// Whether the step changes the cluster
    pub fn is_action(&self) -> bool {
        !matches!(
            self,
            Step::Noop | Step::Wait(_) | Step::AwaitRestore { .. } | Step::AbortScaling(_)
        )
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::CreateMembers(n) => write!(f, "creating {} members", n),
            Step::InitiateReplicaSet => write!(f, "initiating replica set"),
            Step::JoinMember(m) => write!(f, "joining {} to the replica set", m.name),
            Step::RunRestore => write!(f, "restoring archive"),
            Step::AwaitRestore { until } => write!(f, "restore backing off until {}", until),
            Step::AddMember => write!(f, "adding a member"),
            Step::StepDown(m) => write!(f, "stepping down primary {}", m.name),
            Step::RemoveMember(m) => write!(f, "removing member {}", m.name),
            Step::AbortScaling(reason) => write!(f, "scaling aborted: {}", reason),
            Step::RollMember(m) => write!(f, "restarting {} with new limits", m.name),
            Step::AdmitTraffic => write!(f, "admitting client traffic"),
            Step::Wait(reason) => write!(f, "waiting: {}", reason),
            Step::Noop => write!(f, "up to date"),
        }
    }
}

/// Choose the next step
pub fn plan(spec: &ClusterSpec, state: &ClusterState, ctx: &PlanContext<'_>) -> Step {
    if state.members.is_empty() {
        return Step::CreateMembers(spec.replicas);
    }

    if let Some(m) = state.members.iter().find(|m| !m.running) {
        return Step::Wait(format!("member {} is not running", m.name));
    }

    if !state.members.iter().any(|m| m.joined) {
        return Step::InitiateReplicaSet;
    }

    if let Some(m) = state.members.iter().find(|m| !m.joined) {
        // Already dropped from the replica set by an unfinished scale-down
        if m.ordinal >= spec.replicas {
            return Step::RemoveMember(m.clone());
        }
        return Step::JoinMember(m.clone());
    }

    if state.primary.is_none() {
        return Step::Wait("no primary elected".to_string());
    }

    // Nothing is admitted and nothing is resized before the data is in place
    if !ctx.admitted && restore_pending(spec, ctx.restore) {
        if let Some(record) = ctx.restore
            && record.cluster_uid == spec.uid
            && let Some(until) = record.next_attempt_at
            && ctx.now < until
        {
            return Step::AwaitRestore { until };
        }
        if !state.all_healthy() {
            return Step::Wait(format!(
                "{}/{} members healthy before restore",
                state.healthy_count(),
                state.member_count()
            ));
        }
        return Step::RunRestore;
    }

    if !state.has_majority() {
        return Step::Wait(format!(
            "no healthy majority: {}/{} members healthy",
            state.healthy_count(),
            state.member_count()
        ));
    }

    let count = state.member_count();
    if count != spec.replicas && !ctx.quorum_blocked {
        return plan_scaling(spec, state, count);
    }

    if let Some(target) = state
        .outdated_members(&spec.cpu_limit, &spec.memory_limit)
        .first()
    {
        if !state.all_healthy() {
            return Step::Wait(format!(
                "{}/{} members healthy before restarting {}",
                state.healthy_count(),
                count,
                target.name
            ));
        }
        return if state.is_primary(target) {
            Step::StepDown((*target).clone())
        } else {
            Step::RollMember((*target).clone())
        };
    }

    if !ctx.admitted {
        if !state.all_healthy() {
            return Step::Wait(format!(
                "{}/{} members healthy before admitting traffic",
                state.healthy_count(),
                count
            ));
        }
        return Step::AdmitTraffic;
    }

    Step::Noop
}

fn plan_scaling(spec: &ClusterSpec, state: &ClusterState, count: i32) -> Step {
    if count < spec.replicas {
        if !state.all_healthy() {
            return Step::Wait(format!(
                "{}/{} members healthy before adding a member",
                state.healthy_count(),
                count
            ));
        }
        return Step::AddMember;
    }

    let Some(candidate) = state.highest_ordinal() else {
        return Step::Noop;
    };

    let remaining = count - 1;
    let remaining_healthy = state.healthy_count() - i32::from(candidate.healthy);
    if remaining_healthy < majority_of(remaining) {
        return Step::AbortScaling(format!(
            "removing {} would leave {}/{} healthy members, below a majority of {}",
            candidate.name,
            remaining_healthy,
            remaining,
            majority_of(remaining)
        ));
    }

    if !state.all_healthy() {
        return Step::Wait(format!(
            "{}/{} members healthy before removing {}",
            state.healthy_count(),
            count,
            candidate.name
        ));
    }

    if state.is_primary(candidate) {
        Step::StepDown(candidate.clone())
    } else {
        Step::RemoveMember(candidate.clone())
    }
}

/// Persisted inputs of a reconcile pass
#[derive(Debug, Clone)]
pub struct PassInput<'a> {
    pub spec: &'a ClusterSpec,
    pub phase: ClusterPhase,
    pub restore: Option<&'a RestoreRecord>,
    pub admitted: bool,
    pub quorum_blocked_generation: Option<i64>,
}

/// Everything a pass decided and did
#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub phase: ClusterPhase,
    /// Event applied to the state machine this pass, if any
    pub transition: Option<ClusterEvent>,
    pub step: Step,
    /// State observed at the start of the pass
    pub state: ClusterState,
    /// Restore record after the pass, when a restore attempt ran
    pub restore: Option<RestoreRecord>,
    pub admitted: bool,
    pub quorum_blocked_generation: Option<i64>,
    pub requeue: Duration,
}

/// Observe, advance the phase, plan and execute one step
pub async fn run_pass(
    input: PassInput<'_>,
    backend: &dyn MemberBackend,
    restorer: &RestoreController,
    now: DateTime<Utc>,
) -> Result<PassOutcome> {
    let spec = input.spec;

    // A new generation lifts a quorum-risk abort
    let mut quorum_blocked_generation = input
        .quorum_blocked_generation
        .filter(|g| *g == spec.generation);
    let quorum_blocked = quorum_blocked_generation.is_some();

    let state = backend.observe(spec).await?;

    let restore_waiting = !input.admitted && restore_pending(spec, input.restore);
    let ctx = TransitionContext {
        replica_set_ready: !state.members.is_empty()
            && state.members.iter().all(|m| m.joined)
            && state.primary.is_some()
            && state.all_healthy(),
        restore_pending: restore_waiting,
        restore_exhausted: restore_waiting
            && input
                .restore
                .is_some_and(|r| r.cluster_uid == spec.uid && is_exhausted(r, restorer.max_attempts())),
        quorum_blocked,
        ..TransitionContext::new(spec.replicas, state.member_count(), state.healthy_count())
    };

    let mut phase = input.phase;
    let mut transition = None;
    if let Some(event) = determine_event(&phase, &ctx) {
        match ClusterStateMachine::new().transition(&phase, event, &ctx) {
            TransitionResult::Success {
                from,
                to,
                description,
                ..
            } => {
                info!(from = %from, to = %to, event = %event, "{}", description);
                phase = to;
                transition = Some(event);
            }
            TransitionResult::GuardFailed { reason, .. } => {
                info!(phase = %phase, event = %event, reason = %reason, "transition guard failed");
            }
            TransitionResult::InvalidTransition { .. } => {
                warn!(phase = %phase, event = %event, "no transition for event");
            }
        }
    }

    let step = plan(
        spec,
        &state,
        &PlanContext {
            restore: input.restore,
            admitted: input.admitted,
            quorum_blocked,
            now,
        },
    );
    info!(step = %step, "planned step");

    let mut admitted = input.admitted;
    let mut restore = None;
    let requeue = match &step {
        Step::CreateMembers(n) => {
            backend.create_members(spec, *n).await?;
            STEP_REQUEUE
        }
        Step::InitiateReplicaSet => {
            backend.initiate_replica_set(spec, &state).await?;
            STEP_REQUEUE
        }
        Step::JoinMember(member) => {
            backend.join_member(spec, &state, member).await?;
            STEP_REQUEUE
        }
        Step::RunRestore => {
            let record = restorer.restore(spec, &state, input.restore, now).await;
            let requeue = if record.is_complete() {
                STEP_REQUEUE
            } else {
                until(record.next_attempt_at, now)
            };
            restore = Some(record);
            requeue
        }
        Step::AwaitRestore { until: at } => until(Some(*at), now),
        Step::AddMember => {
            backend.add_member(spec, &state).await?;
            STEP_REQUEUE
        }
        Step::StepDown(member) => {
            backend.step_down(spec, &state, member).await?;
            STEP_REQUEUE
        }
        Step::RemoveMember(member) => {
            backend.remove_member(spec, &state, member).await?;
            STEP_REQUEUE
        }
        Step::AbortScaling(reason) => {
            warn!(generation = spec.generation, reason = %reason, "scaling aborted for quorum safety");
            quorum_blocked_generation = Some(spec.generation);
            STEADY_REQUEUE
        }
        Step::RollMember(member) => {
            backend.roll_member(spec, member).await?;
            STEP_REQUEUE
        }
        Step::AdmitTraffic => {
            backend.admit_traffic(spec, &state).await?;
            admitted = true;
            STEP_REQUEUE
        }
        Step::Wait(_) => WAIT_REQUEUE,
        Step::Noop => STEADY_REQUEUE,
    };

    Ok(PassOutcome {
        phase,
        transition,
        step,
        state,
        restore,
        admitted,
        quorum_blocked_generation,
        requeue,
    })
}

/// Time from `now` until `at`, at least one second
fn until(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    at.and_then(|at| (at - now).to_std().ok())
        .unwrap_or_default()
        .max(Duration::from_secs(1))
}
