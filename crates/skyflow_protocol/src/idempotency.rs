use blake3::Hasher;

use crate::types::QueryFingerprint;

const SEP: u8 = 0x1f;

fn hash_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[SEP]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Stable key of a query fingerprint.
///
/// Components, in order:
/// - backend kind and address
/// - catalog count, then each catalog
/// - field count, then each field
/// - canonical constraints
pub fn fingerprint_key(fingerprint: &QueryFingerprint) -> String {
    let catalogs = fingerprint.catalogs.len().to_string();
    let fields = fingerprint.fields.len().to_string();
    let constraints = fingerprint.constraints.canonical();

    let mut parts: Vec<&str> = vec![
        fingerprint.backend.kind().as_str(),
        fingerprint.backend.address(),
        catalogs.as_str(),
    ];
    parts.extend(fingerprint.catalogs.iter().map(String::as_str));
    parts.push(fields.as_str());
    parts.extend(fingerprint.fields.iter().map(String::as_str));
    parts.push(constraints.as_str());
    hash_parts(parts)
}

/// Short prefix of a key for log lines.
pub fn short_key(key: &str) -> &str {
    &key[..key.len().min(12)]
}
