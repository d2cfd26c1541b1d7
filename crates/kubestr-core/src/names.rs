//! Generated object names and labels.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::defaults::{
    CLONE_PREFIX, CREATED_BY_LABEL_KEY, CREATED_BY_LABEL_VALUE, SNAPSHOT_NAME_PREFIX,
};

/// Longest name the tool generates.
pub const MAX_NAME_LENGTH: usize = 64;
const HASH_LENGTH: usize = 5;

/// Shortens `name` to at most [`MAX_NAME_LENGTH`] characters.
///
/// Names that already fit are returned unchanged. Longer names keep their
/// first 58 characters followed by `-` and the first five characters of the
/// URL-safe base64 encoding of their SHA-256 digest.
pub fn shorten(name: &str) -> String {
    if name.chars().count() <= MAX_NAME_LENGTH {
        return name.to_owned();
    }
    let digest = Sha256::digest(name.as_bytes());
    let encoded = base64::encode_config(digest, base64::URL_SAFE_NO_PAD);
    let keep = MAX_NAME_LENGTH - HASH_LENGTH - 1;
    let head: String = name.chars().take(keep).collect();
    format!("{}-{}", head, &encoded[..HASH_LENGTH])
}

/// Name of a snapshot taken at `now`: `kubestr-snapshot-YYYYMMDDhhmmss`.
pub fn snapshot_name(now: DateTime<Utc>) -> String {
    format!("{}{}", SNAPSHOT_NAME_PREFIX, now.format("%Y%m%d%H%M%S"))
}

/// Name of a temporary clone of `name`.
pub fn clone_name(name: &str) -> String {
    shorten(&format!("{}{}", CLONE_PREFIX, name))
}

/// Labels stamped on every created object.
pub fn created_by_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        CREATED_BY_LABEL_KEY.to_owned(),
        CREATED_BY_LABEL_VALUE.to_owned(),
    );
    labels
}

/// Label selector matching [`created_by_labels`].
pub fn created_by_selector() -> String {
    format!("{}={}", CREATED_BY_LABEL_KEY, CREATED_BY_LABEL_VALUE)
}
