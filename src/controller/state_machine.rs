//! Formal finite state machine for the MongoCluster lifecycle
//!
//! Phases move through an explicit transition table with guards, and at most
//! one transition is taken per reconcile pass. `determine_event` maps the
//! observed situation to the event that should be fed to the machine.

use std::fmt;

use crate::crd::ClusterPhase;

/// Events that trigger state transitions in the cluster lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterEvent {
    /// Every member is running, joined and a primary is elected; no restore configured
    MembersCreated,
    /// Members are up and a restore must run before traffic is admitted
    RestoreRequired,
    /// The restore record reached Complete
    RestoreCompleted,
    /// Restore attempts reached the configured bound
    RestoreExhausted,
    /// Fewer than a majority of members are healthy
    MajorityLost,
    /// Declared replica count differs from the member count
    ReplicaCountChanged,
    /// Member count matches the declared replica count again
    ScalingCompleted,
    /// Scaling was aborted because it would risk quorum
    ScalingAborted,
    /// Majority healthy again and nothing blocks admission
    Recovered,
}

impl fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterEvent::MembersCreated => write!(f, "MembersCreated"),
            ClusterEvent::RestoreRequired => write!(f, "RestoreRequired"),
            ClusterEvent::RestoreCompleted => write!(f, "RestoreCompleted"),
            ClusterEvent::RestoreExhausted => write!(f, "RestoreExhausted"),
            ClusterEvent::MajorityLost => write!(f, "MajorityLost"),
            ClusterEvent::ReplicaCountChanged => write!(f, "ReplicaCountChanged"),
            ClusterEvent::ScalingCompleted => write!(f, "ScalingCompleted"),
            ClusterEvent::ScalingAborted => write!(f, "ScalingAborted"),
            ClusterEvent::Recovered => write!(f, "Recovered"),
        }
    }
}

/// Context information available during state transitions
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Declared replica count
    pub desired_replicas: i32,
    /// Members that currently exist
    pub member_count: i32,
    /// Members reporting PRIMARY or SECONDARY
    pub healthy_members: i32,
    /// Every member is joined and a primary is elected
    pub replica_set_ready: bool,
    /// A restore is configured and its record is not Complete
    pub restore_pending: bool,
    /// Restore attempts reached the configured bound
    pub restore_exhausted: bool,
    /// Scaling for the current generation was aborted for quorum safety
    pub quorum_blocked: bool,
}

impl TransitionContext {
    pub fn new(desired_replicas: i32, member_count: i32, healthy_members: i32) -> Self {
        Self {
            desired_replicas,
            member_count,
            healthy_members,
            ..Default::default()
        }
    }

    /// Check if a majority of the existing members is healthy
    pub fn has_majority(&self) -> bool {
        self.member_count > 0 && self.healthy_members > self.member_count / 2
    }

    /// Check if the member count differs from the declared count
    pub fn scaling_needed(&self) -> bool {
        self.member_count != self.desired_replicas
    }
}

/// A state transition definition with optional guard
#[derive(Debug)]
pub struct Transition {
    /// Source state
    pub from: ClusterPhase,
    /// Target state
    pub to: ClusterPhase,
    /// Event that triggers this transition
    pub event: ClusterEvent,
    /// Human-readable description of this transition
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: ClusterPhase,
        to: ClusterPhase,
        event: ClusterEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    /// Transition was successful
    Success {
        from: ClusterPhase,
        to: ClusterPhase,
        event: ClusterEvent,
        description: &'static str,
    },
    /// Transition was not valid for current state
    InvalidTransition {
        current: ClusterPhase,
        event: ClusterEvent,
    },
    /// Guard condition prevented the transition
    GuardFailed {
        from: ClusterPhase,
        to: ClusterPhase,
        event: ClusterEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Phase after applying this result to `current`
    pub fn resulting_phase(&self, current: ClusterPhase) -> ClusterPhase {
        match self {
            TransitionResult::Success { to, .. } => *to,
            _ => current,
        }
    }
}

/// Formal state machine for the MongoCluster lifecycle
pub struct ClusterStateMachine {
    transitions: Vec<Transition>,
}

impl Default for ClusterStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStateMachine {
    /// Create a new state machine with the defined transition table
    pub fn new() -> Self {
        Self {
            transitions: vec![
                // === Bootstrapping ===
                Transition::new(
                    ClusterPhase::Bootstrapping,
                    ClusterPhase::Steady,
                    ClusterEvent::MembersCreated,
                    "Replica set initialized, no restore configured",
                ),
                Transition::new(
                    ClusterPhase::Bootstrapping,
                    ClusterPhase::Restoring,
                    ClusterEvent::RestoreRequired,
                    "Replica set initialized, loading configured archive",
                ),
                // === Restoring ===
                Transition::new(
                    ClusterPhase::Restoring,
                    ClusterPhase::Steady,
                    ClusterEvent::RestoreCompleted,
                    "Restore completed",
                ),
                Transition::new(
                    ClusterPhase::Restoring,
                    ClusterPhase::Degraded,
                    ClusterEvent::RestoreExhausted,
                    "Restore retries exhausted, admission stays blocked",
                ),
                Transition::new(
                    ClusterPhase::Restoring,
                    ClusterPhase::Degraded,
                    ClusterEvent::MajorityLost,
                    "Majority of members unhealthy during restore",
                ),
                // === Steady ===
                Transition::new(
                    ClusterPhase::Steady,
                    ClusterPhase::Scaling,
                    ClusterEvent::ReplicaCountChanged,
                    "Replica count changed, scaling one member at a time",
                ),
                Transition::new(
                    ClusterPhase::Steady,
                    ClusterPhase::Degraded,
                    ClusterEvent::MajorityLost,
                    "Majority of members unhealthy",
                ),
                // === Scaling ===
                Transition::new(
                    ClusterPhase::Scaling,
                    ClusterPhase::Steady,
                    ClusterEvent::ScalingCompleted,
                    "Scaling completed",
                ),
                Transition::new(
                    ClusterPhase::Scaling,
                    ClusterPhase::Steady,
                    ClusterEvent::ScalingAborted,
                    "Scaling aborted to preserve quorum",
                ),
                Transition::new(
                    ClusterPhase::Scaling,
                    ClusterPhase::Degraded,
                    ClusterEvent::MajorityLost,
                    "Majority of members unhealthy during scaling",
                ),
                // === Degraded ===
                Transition::new(
                    ClusterPhase::Degraded,
                    ClusterPhase::Steady,
                    ClusterEvent::Recovered,
                    "Majority healthy again and no restore pending",
                ),
            ],
        }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: &ClusterPhase,
        event: ClusterEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &ClusterPhase, event: &ClusterEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: &ClusterPhase) -> Vec<&ClusterEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    /// Check guard conditions for a transition
    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match (&transition.from, &transition.to, &transition.event) {
            (ClusterPhase::Bootstrapping, _, _) if !ctx.replica_set_ready => Some(format!(
                "Replica set not initialized: {}/{} members healthy",
                ctx.healthy_members, ctx.desired_replicas
            )),
            (_, ClusterPhase::Steady, ClusterEvent::MembersCreated) if ctx.restore_pending => {
                Some("Restore is configured and not complete".to_string())
            }
            // Leaving Restoring/Degraded for Steady requires a healthy majority
            (_, ClusterPhase::Steady, ClusterEvent::RestoreCompleted | ClusterEvent::Recovered)
                if !ctx.has_majority() =>
            {
                Some(format!(
                    "No healthy majority: {}/{} members healthy",
                    ctx.healthy_members, ctx.member_count
                ))
            }
            (_, ClusterPhase::Steady, ClusterEvent::Recovered) if ctx.restore_pending => {
                Some("Restore is still pending".to_string())
            }
            (_, ClusterPhase::Steady, ClusterEvent::ScalingCompleted) if ctx.scaling_needed() => {
                Some(format!(
                    "Member count {} does not match desired {}",
                    ctx.member_count, ctx.desired_replicas
                ))
            }
            (_, ClusterPhase::Degraded, ClusterEvent::MajorityLost) if ctx.has_majority() => {
                Some("Majority is healthy".to_string())
            }
            _ => None,
        }
    }
}

/// Determine the event implied by the observed situation, if any
pub fn determine_event(current_phase: &ClusterPhase, ctx: &TransitionContext) -> Option<ClusterEvent> {
    match current_phase {
        ClusterPhase::Bootstrapping => {
            if !ctx.replica_set_ready {
                None
            } else if ctx.restore_pending {
                Some(ClusterEvent::RestoreRequired)
            } else {
                Some(ClusterEvent::MembersCreated)
            }
        }
        ClusterPhase::Restoring => {
            if !ctx.has_majority() {
                Some(ClusterEvent::MajorityLost)
            } else if !ctx.restore_pending {
                Some(ClusterEvent::RestoreCompleted)
            } else if ctx.restore_exhausted {
                Some(ClusterEvent::RestoreExhausted)
            } else {
                None
            }
        }
        ClusterPhase::Steady => {
            if !ctx.has_majority() {
                Some(ClusterEvent::MajorityLost)
            } else if ctx.scaling_needed() && !ctx.quorum_blocked {
                Some(ClusterEvent::ReplicaCountChanged)
            } else {
                None
            }
        }
        ClusterPhase::Scaling => {
            if !ctx.has_majority() {
                Some(ClusterEvent::MajorityLost)
            } else if ctx.quorum_blocked {
                Some(ClusterEvent::ScalingAborted)
            } else if !ctx.scaling_needed() {
                Some(ClusterEvent::ScalingCompleted)
            } else {
                None
            }
        }
        ClusterPhase::Degraded => {
            if ctx.restore_pending {
                None
            } else if ctx.has_majority() {
                Some(ClusterEvent::Recovered)
            } else {
                None
            }
        }
    }
}
