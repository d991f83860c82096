//! Unit tests for archive naming and "latest" selection

use chrono::NaiveDate;
use mongo_operator::backup::archive::{
    archive_key, backup_id, key_timestamp, listing_prefix, select_latest,
};

use crate::common::at;

#[test]
fn test_backup_id_and_key_share_the_slot_timestamp() {
    assert_eq!(backup_id("mongo", at(2, 0)), "mongo-2019-02-07_020000");
    assert_eq!(
        archive_key("nightly/eu", "mongo", at(14, 30)),
        "nightly/eu/mongo-2019-02-07_143000.archive.gz"
    );
}

#[test]
fn test_listing_prefix_ends_with_single_slash() {
    assert_eq!(listing_prefix("backups"), "backups/");
    assert_eq!(listing_prefix("backups/"), "backups/");
}

#[test]
fn test_key_timestamp_formats() {
    let expected = NaiveDate::from_ymd_opt(2019, 2, 7)
        .unwrap()
        .and_hms_opt(2, 0, 0)
        .unwrap();
    assert_eq!(
        key_timestamp("backups/mongo-2019-02-07_020000.archive.gz"),
        Some(expected)
    );
    assert_eq!(
        key_timestamp("a-2019-02-07"),
        NaiveDate::from_ymd_opt(2019, 2, 7).unwrap().and_hms_opt(0, 0, 0)
    );
    assert_eq!(key_timestamp("backups/readme.txt"), None);
}

#[test]
fn test_latest_among_date_named_archives() {
    let keys = ["a-2019-01-01", "a-2019-02-07", "a-2018-12-31"];
    assert_eq!(select_latest(keys), Some("a-2019-02-07".to_string()));
}

#[test]
fn test_latest_orders_by_timestamp_not_by_name() {
    // "mongo-old" sorts after "mongo" by name but carries an older timestamp
    let keys = [
        "backups/mongo-old-2019-02-06_230000.archive.gz",
        "backups/mongo-2019-02-07_010000.archive.gz",
    ];
    assert_eq!(
        select_latest(keys),
        Some("backups/mongo-2019-02-07_010000.archive.gz".to_string())
    );
}

#[test]
fn test_time_of_day_breaks_date_ties() {
    let keys = [
        "backups/mongo-2019-02-07_235900.archive.gz",
        "backups/mongo-2019-02-07",
    ];
    assert_eq!(
        select_latest(keys),
        Some("backups/mongo-2019-02-07_235900.archive.gz".to_string())
    );
}

#[test]
fn test_keys_outside_the_naming_convention_never_win() {
    assert_eq!(
        select_latest(["backups/manual-dump.gz", "backups/a-2019-02-07"]),
        Some("backups/a-2019-02-07".to_string())
    );
    assert_eq!(select_latest(["backups/manual-dump.gz"]), None);
    assert_eq!(select_latest(["backups/README.txt", "backups/notes"]), None);
}
