//! Session identifiers and the `tapped` annotation ledger.
//!
//! A session is one end-to-end log capture, identified by `lt-<16 hex>`.
//! The identifier is carried in the forwarder container name, the pod
//! template annotations, and the forwarder environment. The `tapped`
//! annotation is a comma-separated ordered list of active session IDs and
//! is the authoritative multi-tenancy ledger for a workload.

use rand::rngs::OsRng;
use rand::RngCore;

/// Prefix of every forwarder container injected by LogTap.
pub const FORWARDER_PREFIX: &str = "logtap-forwarder-";

/// Mint a new collision-resistant session identifier (`lt-<16 hex>`).
///
/// The 8 random bytes come from the OS CSPRNG, so two sessions colliding
/// anywhere in a cluster is overwhelmingly improbable.
pub fn new_session_id() -> String {
    let mut raw = [0u8; 8];
    OsRng.fill_bytes(&mut raw);
    format!("lt-{}", hex::encode(raw))
}

/// Whether `s` is a well-formed session identifier.
pub fn is_session_id(s: &str) -> bool {
    match s.strip_prefix("lt-") {
        Some(rest) => rest.len() == 16 && rest.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()),
        None => false,
    }
}

/// Parse a `tapped` annotation value into its session list.
///
/// Empty or missing values parse to an empty list; surrounding whitespace
/// around individual entries is tolerated.
pub fn parse_sessions(annotation: &str) -> Vec<String> {
    annotation
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Append a session to a `tapped` value, preserving existing order.
pub fn add_session(old: &str, session: &str) -> String {
    let mut sessions = parse_sessions(old);
    sessions.push(session.to_string());
    sessions.join(",")
}

/// Remove a session from a `tapped` value, preserving the order of the rest.
pub fn remove_session(old: &str, session: &str) -> String {
    parse_sessions(old)
        .into_iter()
        .filter(|s| s != session)
        .collect::<Vec<_>>()
        .join(",")
}

/// Name of the forwarder container for a session.
pub fn forwarder_container_name(session: &str) -> String {
    format!("{FORWARDER_PREFIX}{session}")
}
