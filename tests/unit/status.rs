//! Unit tests for status conditions and the reconciler's status patch

use mongo_operator::controller::cluster_state::ClusterState;
use mongo_operator::controller::planner::{PassOutcome, STEADY_REQUEUE, Step};
use mongo_operator::controller::status::{
    ConditionBuilder, condition_status, condition_types, owned_status_changed,
    owned_status_patch, pass_status, phase_started_at,
};
use mongo_operator::crd::{
    BackupPhase, BackupRecord, BackupStatus, ClusterPhase, Condition, MongoClusterStatus,
    RestorePhase, RestoreRecord,
};

use crate::common::*;

fn outcome(phase: ClusterPhase, step: Step, state: ClusterState) -> PassOutcome {
    PassOutcome {
        phase,
        transition: None,
        step,
        state,
        restore: None,
        admitted: true,
        quorum_blocked_generation: None,
        requeue: STEADY_REQUEUE,
    }
}

fn condition<'a>(status: &'a MongoClusterStatus, type_: &str) -> &'a Condition {
    status
        .conditions
        .iter()
        .find(|c| c.type_ == type_)
        .unwrap_or_else(|| panic!("missing condition {}", type_))
}

fn failed_restore(attempts: u32) -> RestoreRecord {
    let mut record = RestoreRecord::pending(TEST_UID, TEST_BUCKET);
    record.status = RestorePhase::Failed;
    record.attempts = attempts;
    record.error_kind = Some("DataIntegrity".to_string());
    record.message = Some("archive is not a valid gzip stream".to_string());
    record
}

mod condition_builder_tests {
    use super::*;

    #[test]
    fn test_new_condition_is_added() {
        let conditions = ConditionBuilder::new(Some(3))
            .ready(true, "ClusterReady", "all good")
            .build();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, condition_types::READY);
        assert_eq!(conditions[0].status, condition_status::TRUE);
        assert_eq!(conditions[0].observed_generation, Some(3));
    }

    #[test]
    fn test_transition_time_only_moves_on_status_change() {
        let existing = vec![Condition {
            type_: condition_types::READY.to_string(),
            status: condition_status::TRUE.to_string(),
            reason: "ClusterReady".to_string(),
            message: "old".to_string(),
            last_transition_time: "2019-02-07T00:00:00+00:00".to_string(),
            observed_generation: Some(1),
        }];

        let same = ConditionBuilder::from_existing(existing.clone(), Some(2))
            .ready(true, "ClusterReady", "new message")
            .build();
        assert_eq!(same[0].last_transition_time, "2019-02-07T00:00:00+00:00");
        assert_eq!(same[0].message, "new message");
        assert_eq!(same[0].observed_generation, Some(2));

        let flipped = ConditionBuilder::from_existing(existing, Some(2))
            .ready(false, "Scaling", "adding a member")
            .build();
        assert_ne!(flipped[0].last_transition_time, "2019-02-07T00:00:00+00:00");
        assert_eq!(flipped[0].status, condition_status::FALSE);
    }

    #[test]
    fn test_backup_condition_follows_last_record() {
        let mut record = BackupRecord::pending("mongo-1", TEST_BUCKET, "backups/mongo-1", at(2, 0));
        let in_progress = ConditionBuilder::new(None).backup_succeeded(&record).build();
        assert_eq!(in_progress[0].status, condition_status::UNKNOWN);

        record.advance(BackupPhase::Uploading).unwrap();
        record.complete(512, at(2, 1)).unwrap();
        let done = ConditionBuilder::new(None).backup_succeeded(&record).build();
        assert_eq!(done[0].status, condition_status::TRUE);
        assert!(done[0].message.contains("512 bytes"));
    }

    #[test]
    fn test_restored_condition_reports_error_kind() {
        let record = failed_restore(1);
        let conditions = ConditionBuilder::new(None).restored(Some(&record)).build();
        assert_eq!(conditions[0].status, condition_status::FALSE);
        assert_eq!(conditions[0].reason, "DataIntegrity");
        assert!(conditions[0].message.contains("attempt 1"));
    }
}

mod pass_status_tests {
    use super::*;

    #[test]
    fn test_steady_admitted_cluster_is_ready() {
        let cluster = create_test_cluster("mongo", "default", 3);
        let spec = test_spec(&cluster);
        let status = pass_status(
            &cluster,
            &spec,
            &outcome(ClusterPhase::Steady, Step::Noop, healthy_state(3)),
            3,
            at(3, 0),
        );

        assert_eq!(status.phase, ClusterPhase::Steady);
        assert_eq!(status.ready_members, 3);
        assert_eq!(status.members, vec!["mongo-0", "mongo-1", "mongo-2"]);
        assert_eq!(status.primary.as_deref(), Some("mongo-0"));
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(condition(&status, condition_types::READY).status, condition_status::TRUE);
        assert_eq!(
            condition(&status, condition_types::PROGRESSING).status,
            condition_status::FALSE
        );
        assert_eq!(
            condition(&status, condition_types::QUORUM_SAFE).status,
            condition_status::TRUE
        );
        // No restore configured, so no Restored condition
        assert!(
            status
                .conditions
                .iter()
                .all(|c| c.type_ != condition_types::RESTORED)
        );
    }

    #[test]
    fn test_exhausted_restore_is_reported_as_degraded() {
        let cluster = MongoClusterBuilder::new("mongo", "default")
            .with_restore_from("latest")
            .build();
        let spec = test_spec(&cluster);
        let mut out = outcome(
            ClusterPhase::Degraded,
            Step::Wait("restore backoff".to_string()),
            healthy_state(3),
        );
        out.admitted = false;
        out.restore = Some(failed_restore(3));

        let status = pass_status(&cluster, &spec, &out, 3, at(3, 0));

        let degraded = condition(&status, condition_types::DEGRADED);
        assert_eq!(degraded.status, condition_status::TRUE);
        assert_eq!(degraded.reason, "RestoreExhausted");
        assert_eq!(condition(&status, condition_types::READY).status, condition_status::FALSE);
        assert_eq!(
            condition(&status, condition_types::RESTORED).reason,
            "DataIntegrity"
        );
        assert!(!status.admitted);
    }

    #[test]
    fn test_quorum_block_is_reported() {
        let cluster = create_test_cluster("mongo", "default", 3);
        let spec = test_spec(&cluster);
        let mut out = outcome(ClusterPhase::Steady, Step::Noop, healthy_state(5));
        out.quorum_blocked_generation = Some(1);

        let status = pass_status(&cluster, &spec, &out, 3, at(3, 0));

        let quorum = condition(&status, condition_types::QUORUM_SAFE);
        assert_eq!(quorum.status, condition_status::FALSE);
        assert_eq!(quorum.reason, "QuorumRisk");
        assert_eq!(status.quorum_blocked_generation, Some(1));
    }

    #[test]
    fn test_restore_of_previous_identity_is_ignored() {
        let mut foreign = failed_restore(3);
        foreign.cluster_uid = "previous-uid".to_string();
        let cluster = MongoClusterBuilder::new("mongo", "default")
            .with_restore_from("latest")
            .with_status(MongoClusterStatus {
                restore: Some(foreign),
                ..Default::default()
            })
            .build();
        let spec = test_spec(&cluster);

        let status = pass_status(
            &cluster,
            &spec,
            &outcome(ClusterPhase::Bootstrapping, Step::InitiateReplicaSet, ClusterState::default()),
            3,
            at(3, 0),
        );

        assert_eq!(
            condition(&status, condition_types::RESTORED).reason,
            "RestorePending"
        );
    }

    #[test]
    fn test_backup_record_is_carried_and_surfaced() {
        let mut last = BackupRecord::pending("mongo-1", TEST_BUCKET, "backups/mongo-1", at(2, 0));
        last.fail("no healthy member", at(2, 0)).unwrap();
        let cluster = MongoClusterBuilder::new("mongo", "default")
            .with_status(MongoClusterStatus {
                backup: Some(BackupStatus {
                    last_scheduled_time: Some(at(2, 0)),
                    last: Some(last.clone()),
                    history: vec![last],
                }),
                ..Default::default()
            })
            .build();
        let spec = test_spec(&cluster);

        let status = pass_status(
            &cluster,
            &spec,
            &outcome(ClusterPhase::Steady, Step::Noop, healthy_state(3)),
            3,
            at(3, 0),
        );

        let backup = condition(&status, condition_types::BACKUP_SUCCEEDED);
        assert_eq!(backup.status, condition_status::FALSE);
        assert_eq!(backup.message, "no healthy member");
        assert!(status.backup.is_some());
    }

    #[test]
    fn test_phase_start_is_kept_while_phase_is_unchanged() {
        let existing = MongoClusterStatus {
            phase: ClusterPhase::Steady,
            phase_started_at: Some("2019-02-07T01:00:00+00:00".to_string()),
            ..Default::default()
        };
        assert_eq!(
            phase_started_at(Some(&existing), ClusterPhase::Steady, at(3, 0)).as_deref(),
            Some("2019-02-07T01:00:00+00:00")
        );
        assert_eq!(
            phase_started_at(Some(&existing), ClusterPhase::Scaling, at(3, 0)),
            Some(at(3, 0).to_rfc3339())
        );
    }
}

mod patch_tests {
    use super::*;

    #[test]
    fn test_patch_leaves_other_writers_fields_out() {
        let status = MongoClusterStatus {
            phase: ClusterPhase::Steady,
            restore: Some(RestoreRecord::pending(TEST_UID, TEST_BUCKET)),
            backup: Some(BackupStatus::default()),
            ..Default::default()
        };
        let patch = owned_status_patch(&status).unwrap();
        let body = patch["status"].as_object().unwrap();

        assert!(!body.contains_key("restore"));
        assert!(!body.contains_key("backup"));
        assert_eq!(body["phase"], "Steady");
    }

    #[test]
    fn test_patch_clears_unset_optional_fields() {
        let patch = owned_status_patch(&MongoClusterStatus::default()).unwrap();
        let body = patch["status"].as_object().unwrap();

        for field in ["primary", "quorumBlockedGeneration", "lastError", "members"] {
            assert!(body[field].is_null(), "{} should be null", field);
        }
    }

    #[test]
    fn test_change_detection_ignores_other_writers_fields() {
        let existing = MongoClusterStatus {
            phase: ClusterPhase::Steady,
            ready_members: 3,
            ..Default::default()
        };
        let with_backup = MongoClusterStatus {
            backup: Some(BackupStatus::default()),
            ..existing.clone()
        };
        assert!(!owned_status_changed(Some(&existing), &with_backup));

        let scaled = MongoClusterStatus {
            ready_members: 4,
            ..existing.clone()
        };
        assert!(owned_status_changed(Some(&existing), &scaled));
        assert!(owned_status_changed(None, &existing));
    }
}
