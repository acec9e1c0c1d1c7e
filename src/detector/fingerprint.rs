//! Incident fingerprinting
//!
//! Recurrences of "the same kind of failure" must collapse onto one
//! incident row, so the fingerprint hashes a normalized message template
//! rather than the raw line: identifiers that vary per occurrence
//! (numbers, UUIDs, durations, quoted strings) become typed placeholders.

use crate::db::LogLevel;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

struct Normalizer {
    uuid: Regex,
    hex: Regex,
    duration: Regex,
    quoted: Regex,
    number: Regex,
    whitespace: Regex,
}

fn normalizer() -> &'static Normalizer {
    static NORMALIZER: OnceLock<Normalizer> = OnceLock::new();
    NORMALIZER.get_or_init(|| Normalizer {
        uuid: Regex::new(
            r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}",
        )
        .unwrap(),
        hex: Regex::new(r"0x[0-9a-fA-F]+").unwrap(),
        duration: Regex::new(r"\b\d+(?:\.\d+)?\s?(?:ms|us|ns|s|m|h)\b").unwrap(),
        quoted: Regex::new(r#""[^"]*"|'[^']*'"#).unwrap(),
        number: Regex::new(r"\d+").unwrap(),
        whitespace: Regex::new(r"\s+").unwrap(),
    })
}

/// Reduce a raw log message to its template.
pub fn normalize_template(message: &str) -> String {
    let n = normalizer();
    // Order matters: quoted strings may contain numbers, durations are
    // number+unit, and bare numbers come last.
    let template = n.quoted.replace_all(message, "<str>");
    let template = n.uuid.replace_all(&template, "<uuid>");
    let template = n.hex.replace_all(&template, "<hex>");
    let template = n.duration.replace_all(&template, "<dur>");
    let template = n.number.replace_all(&template, "<num>");
    let template = n.whitespace.replace_all(template.trim(), " ");
    template.to_lowercase()
}

/// Stable fingerprint over `(template, level, service)`.
pub fn fingerprint(service_id: &str, level: LogLevel, message: &str) -> String {
    let template = normalize_template(message);
    let mut hasher = Sha256::new();
    hasher.update(template.as_bytes());
    hasher.update(b"\n");
    hasher.update(level.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(service_id.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers_and_ids_collapse() {
        let a = normalize_template("worker 17 crashed after 250ms on request 0xdeadbeef");
        let b = normalize_template("worker 9 crashed after 4s on request 0xcafe");
        assert_eq!(a, b);
        assert_eq!(a, "worker <num> crashed after <dur> on request <hex>");
    }

    #[test]
    fn test_uuids_and_quotes_collapse() {
        let a = normalize_template(
            r#"session 550e8400-e29b-41d4-a716-446655440000 rejected: "bad token""#,
        );
        let b = normalize_template(
            r#"session 123e4567-e89b-12d3-a456-426614174000 rejected: "expired""#,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_failures_stay_distinct() {
        let oom = normalize_template("FATAL: Out of memory - killed by OOM killer");
        let refused = normalize_template("connect ECONNREFUSED 10.0.0.1:5432");
        assert_ne!(oom, refused);
    }

    #[test]
    fn test_fingerprint_stable_across_occurrences() {
        let a = fingerprint("svc-1", LogLevel::Fatal, "OOM killed pid 4242");
        let b = fingerprint("svc-1", LogLevel::Fatal, "OOM killed pid 999");
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_varies_by_service_and_level() {
        let base = fingerprint("svc-1", LogLevel::Error, "boom");
        assert_ne!(base, fingerprint("svc-2", LogLevel::Error, "boom"));
        assert_ne!(base, fingerprint("svc-1", LogLevel::Fatal, "boom"));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn normalization_is_idempotent(message in ".{0,200}") {
            let once = normalize_template(&message);
            let twice = normalize_template(&once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn fingerprint_is_deterministic(message in ".{0,200}") {
            let a = fingerprint("svc", LogLevel::Error, &message);
            let b = fingerprint("svc", LogLevel::Error, &message);
            prop_assert_eq!(a, b);
        }
    }
}
