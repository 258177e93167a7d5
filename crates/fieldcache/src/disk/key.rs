//! Mapping between cache keys and snapshot file names.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;

/// File extension of snapshot envelopes.
pub const ENVELOPE_EXTENSION: &str = "json";

/// File extension of binary sidecar files.
pub const SIDECAR_EXTENSION: &str = "bin";

/// Prefix marking an envelope value as a reference to a sidecar file.
pub const SIDECAR_PREFIX: &str = "file://";

/// Encodes a key into a file name stem.
///
/// Uses the URL-safe base64 alphabet (`-` and `_` instead of `+` and `/`) with padding, so
/// that any key yields a valid file name.
pub fn file_stem(key: &str) -> String {
    URL_SAFE.encode(key.as_bytes())
}

/// Decodes a file name stem back into the key, if it is valid.
pub fn key_from_stem(stem: &str) -> Option<String> {
    let bytes = URL_SAFE.decode(stem).ok()?;
    String::from_utf8(bytes).ok()
}

/// The envelope file name of a key stem.
pub fn envelope_name(stem: &str) -> String {
    format!("{stem}.{ENVELOPE_EXTENSION}")
}

/// The sidecar file name of a field of a key stem.
pub fn sidecar_name(stem: &str, field: &str) -> String {
    format!("{stem}_{field}.{SIDECAR_EXTENSION}")
}

/// Splits a sidecar file name into its key stem and field name.
pub fn split_sidecar_name(file_name: &str) -> Option<(&str, &str)> {
    let base = file_name.strip_suffix(SIDECAR_EXTENSION)?.strip_suffix('.')?;
    base.rsplit_once('_')
}

/// Extracts the sidecar file name from an envelope value, like `file://{name}`.
pub fn sidecar_reference(value: &serde_json::Value) -> Option<&str> {
    value.as_str()?.strip_prefix(SIDECAR_PREFIX)
}

/// Returns `true` if `name` is a plain file name that stays inside the snapshot directory.
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
}
