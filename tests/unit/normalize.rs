//! Unit tests for spec normalization and spec diffs

use mongo_operator::controller::normalize::{
    DEFAULT_BACKUP_PREFIX, DEFAULT_CPU_LIMIT, DEFAULT_MEMORY_LIMIT, MAX_REPLICAS, MIN_REPLICAS,
    RestoreSource, diff, normalize,
};
use mongo_operator::controller::Error;

use crate::common::*;

fn rejected(cluster: &mongo_operator::crd::MongoCluster) -> String {
    match normalize(cluster) {
        Err(Error::ValidationError(msg)) => msg,
        other => panic!("expected a validation error, got {:?}", other),
    }
}

mod replica_bounds {
    use super::*;

    #[test]
    fn test_below_minimum_is_rejected() {
        for replicas in [-1, 0, 1, MIN_REPLICAS - 1] {
            let cluster = create_test_cluster("mongo", "default", replicas);
            let msg = rejected(&cluster);
            assert!(msg.contains("below minimum"), "{}", msg);
        }
    }

    #[test]
    fn test_above_maximum_is_rejected() {
        let cluster = create_test_cluster("mongo", "default", MAX_REPLICAS + 1);
        assert!(rejected(&cluster).contains("exceeds maximum"));
    }

    #[test]
    fn test_bounds_are_inclusive() {
        for replicas in [MIN_REPLICAS, 5, MAX_REPLICAS] {
            let spec = test_spec(&create_test_cluster("mongo", "default", replicas));
            assert_eq!(spec.replicas, replicas);
        }
    }
}

mod defaults {
    use super::*;

    #[test]
    fn test_defaults_are_filled_in() {
        let spec = test_spec(&create_test_cluster("mongo", "databases", 3));
        assert_eq!(spec.name, "mongo");
        assert_eq!(spec.namespace, "databases");
        assert_eq!(spec.uid, TEST_UID);
        assert_eq!(spec.generation, 1);
        assert_eq!(spec.cpu_limit, DEFAULT_CPU_LIMIT);
        assert_eq!(spec.memory_limit, DEFAULT_MEMORY_LIMIT);
        assert_eq!(spec.prefix, DEFAULT_BACKUP_PREFIX);
        assert_eq!(spec.bucket, TEST_BUCKET);
        assert_eq!(spec.restore_bucket, TEST_BUCKET);
        assert_eq!(spec.restore_from, None);
        assert_eq!(spec.backup_cron.as_str(), "0 2 * * *");
    }

    #[test]
    fn test_prefix_trailing_slash_is_dropped() {
        let cluster = MongoClusterBuilder::new("mongo", "default")
            .with_prefix("nightly/mongo/")
            .build();
        assert_eq!(test_spec(&cluster).prefix, "nightly/mongo");
    }

    #[test]
    fn test_blank_prefix_uses_default() {
        let cluster = MongoClusterBuilder::new("mongo", "default")
            .with_prefix("  ")
            .build();
        assert_eq!(test_spec(&cluster).prefix, DEFAULT_BACKUP_PREFIX);
    }

    #[test]
    fn test_explicit_limits_are_kept() {
        let cluster = MongoClusterBuilder::new("mongo", "default")
            .with_limits("500m", "4Gi")
            .build();
        let spec = test_spec(&cluster);
        assert_eq!(spec.cpu_limit, "500m");
        assert_eq!(spec.memory_limit, "4Gi");
    }
}

mod restore_source {
    use super::*;

    #[test]
    fn test_latest_literal() {
        let cluster = MongoClusterBuilder::new("mongo", "default")
            .with_restore_from("latest")
            .build();
        assert_eq!(test_spec(&cluster).restore_from, Some(RestoreSource::Latest));
    }

    #[test]
    fn test_literal_key() {
        let cluster = MongoClusterBuilder::new("mongo", "default")
            .with_restore_from("backups/mongo-2019-02-07_020000.archive.gz")
            .build();
        assert_eq!(
            test_spec(&cluster).restore_from,
            Some(RestoreSource::Key(
                "backups/mongo-2019-02-07_020000.archive.gz".to_string()
            ))
        );
    }

    #[test]
    fn test_empty_restore_from_is_rejected() {
        let cluster = MongoClusterBuilder::new("mongo", "default")
            .with_restore_from(" ")
            .build();
        assert!(rejected(&cluster).contains("restore_from"));
    }

    #[test]
    fn test_restore_bucket_override() {
        let cluster = MongoClusterBuilder::new("mongo", "default")
            .with_restore_from("latest")
            .with_restore_bucket("prod-backups")
            .build();
        let spec = test_spec(&cluster);
        assert_eq!(spec.bucket, TEST_BUCKET);
        assert_eq!(spec.restore_bucket, "prod-backups");
    }
}

mod invalid_fields {
    use super::*;

    #[test]
    fn test_bad_cron_is_rejected() {
        let cluster = MongoClusterBuilder::new("mongo", "default")
            .with_cron("0 25 * * *")
            .build();
        assert!(rejected(&cluster).contains("invalid backup cron"));
    }

    #[test]
    fn test_never_firing_cron_is_rejected() {
        let cluster = MongoClusterBuilder::new("mongo", "default")
            .with_cron("0 0 30 2 *")
            .build();
        assert!(rejected(&cluster).contains("never fires"));
    }

    #[test]
    fn test_empty_bucket_is_rejected() {
        let cluster = MongoClusterBuilder::new("mongo", "default")
            .with_bucket("")
            .build();
        assert!(rejected(&cluster).contains("bucket"));
    }

    #[test]
    fn test_incomplete_secret_ref_is_rejected() {
        let cluster = MongoClusterBuilder::new("mongo", "default")
            .with_secret("gcs-credentials", "")
            .build();
        assert!(rejected(&cluster).contains("secretKeyRef"));
    }

    #[test]
    fn test_bad_limits_are_rejected() {
        let cluster = MongoClusterBuilder::new("mongo", "default")
            .with_limits("lots", "2Gi")
            .build();
        assert!(rejected(&cluster).contains("cpu_limit"));

        let cluster = MongoClusterBuilder::new("mongo", "default")
            .with_limits("1", "plenty")
            .build();
        assert!(rejected(&cluster).contains("memory_limit"));
    }
}

mod spec_diff {
    use super::*;

    #[test]
    fn test_identical_specs_have_no_changes() {
        let spec = test_spec(&create_test_cluster("mongo", "default", 3));
        assert!(!diff(&spec, &spec).has_changes());
    }

    #[test]
    fn test_scale_and_limits() {
        let old = test_spec(&create_test_cluster("mongo", "default", 5));
        let new = test_spec(
            &MongoClusterBuilder::new("mongo", "default")
                .with_replicas(3)
                .with_limits("2", "2Gi")
                .build(),
        );
        let d = diff(&old, &new);
        assert_eq!(d.replica_delta, -2);
        assert!(d.replicas_changed());
        assert!(d.requires_rolling_update());
        assert!(!d.backup_changed);
    }

    #[test]
    fn test_schedule_change() {
        let old = test_spec(&create_test_cluster("mongo", "default", 3));
        let new = test_spec(
            &MongoClusterBuilder::new("mongo", "default")
                .with_cron("@hourly")
                .build(),
        );
        let d = diff(&old, &new);
        assert!(d.backup_changed);
        assert!(!d.requires_rolling_update());
    }

    #[test]
    fn test_equivalent_quantities_are_not_a_resource_change() {
        let old = test_spec(
            &MongoClusterBuilder::new("mongo", "default")
                .with_limits("0.5", "2048Mi")
                .build(),
        );
        let new = test_spec(
            &MongoClusterBuilder::new("mongo", "default")
                .with_limits("500m", "2Gi")
                .build(),
        );
        assert!(!diff(&old, &new).has_changes());
    }
}
