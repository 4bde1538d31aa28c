//! Filesystem-safe names for per-resource state directories.
//!
//! Resource names are arbitrary user strings ("/a/b", "foo:bar", unicode),
//! but each resource gets a directory under the engine prefix that must be
//! stable across runs and safe on any filesystem. The directory name
//! carries both an exact encoding (url-safe base64, for uniqueness) and a
//! mangled human-readable suffix (for operators poking around the state
//! dir): `<kind>-<b64name>+<safename>`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Directory name for one resource's persisted state.
pub fn res_dir_name(kind: &str, name: &str) -> String {
    format!(
        "{}-{}+{}",
        kind,
        URL_SAFE_NO_PAD.encode(name.as_bytes()),
        safe_name(name)
    )
}

/// Mangle a resource name into a readable, filesystem-safe token. Anything
/// outside `[A-Za-z0-9._-]` becomes an underscore.
pub fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
