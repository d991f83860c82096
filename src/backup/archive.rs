//! Archive naming, compression and "latest" selection

use std::io::{Read, Write};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Suffix of every archive the operator writes
pub const ARCHIVE_SUFFIX: &str = ".archive.gz";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H%M%S";
const TIMESTAMP_LEN: usize = 17;
const DATE_FORMAT: &str = "%Y-%m-%d";
const DATE_LEN: usize = 10;

/// Backup id for a cluster and slot, e.g. `mongo-2019-02-07_020000`
pub fn backup_id(cluster: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}", cluster, at.format(TIMESTAMP_FORMAT))
}

/// Object key for a backup: `{prefix}/{cluster}-{YYYY-MM-DD_HHMMSS}.archive.gz`
pub fn archive_key(prefix: &str, cluster: &str, at: DateTime<Utc>) -> String {
    format!("{}/{}{}", prefix, backup_id(cluster, at), ARCHIVE_SUFFIX)
}

/// Listing prefix for a backup prefix, always ending with `/`
pub fn listing_prefix(prefix: &str) -> String {
    format!("{}/", prefix.trim_end_matches('/'))
}

/// Gzip a raw dump
pub fn compress(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 4), Compression::default());
    encoder.write_all(raw)?;
    encoder.finish()
}

/// Fully decompress an archive, failing on any truncation or corruption
pub fn decompress(archive: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(archive);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    Ok(raw)
}

/// Timestamp embedded in an archive key, if it follows the naming convention
///
/// Accepts both `...-YYYY-MM-DD_HHMMSS` and date-only `...-YYYY-MM-DD` names,
/// with or without the archive suffix.
pub fn key_timestamp(key: &str) -> Option<NaiveDateTime> {
    let file = key.rsplit('/').next().unwrap_or(key);
    let stem = file
        .strip_suffix(ARCHIVE_SUFFIX)
        .or_else(|| file.strip_suffix(".gz"))
        .unwrap_or(file);

    let tail = |len: usize| stem.len().checked_sub(len).and_then(|at| stem.get(at..));

    if let Some(ts) = tail(TIMESTAMP_LEN)
        && let Ok(parsed) = NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT)
    {
        return Some(parsed);
    }

    tail(DATE_LEN)
        .and_then(|d| NaiveDate::parse_from_str(d, DATE_FORMAT).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Pick the newest archive from a storage listing
///
/// Only keys whose name carries a timestamp are candidates; anything else in
/// the prefix (notes, manual dumps, directory placeholders) is ignored. Equal
/// timestamps fall back to lexicographic order.
pub fn select_latest<'a, I>(keys: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    keys.into_iter()
        .filter_map(|k| key_timestamp(k).map(|ts| (ts, k)))
        .max()
        .map(|(_, k)| k.to_string())
}
