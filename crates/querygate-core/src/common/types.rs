//! Common types shared between the frontend and its peers.
//!
//! The query id and the tenant metadata key form the compile-time contract
//! between the dispatcher, the schedulers and the worker processes: a query
//! id correlates an ENQUEUE with its CANCEL and its out-of-band result, and
//! every RPC that acts on behalf of a tenant carries the tenant id in the
//! same metadata entry.

use std::time::Duration;

use tonic::metadata::MetadataMap;

/// Identifier correlating an ENQUEUE, its status ack, a CANCEL and the result
/// delivery. Allocated from a process-wide monotonic counter; ids are only
/// meaningful within a single frontend process lifetime.
pub type QueryId = u64;

/// Metadata key carrying the tenant id on `DeliverResult` and `RoundTrip`
/// calls.
pub const TENANT_METADATA_KEY: &str = "x-tenant-id";

/// Metadata key carrying the caller's deadline, set by gRPC clients that
/// attach a timeout to the call.
pub const GRPC_TIMEOUT_METADATA_KEY: &str = "grpc-timeout";

/// Extracts the tenant id from gRPC call metadata.
///
/// Returns `None` when the entry is absent, empty, or not valid ASCII.
pub fn tenant_from_metadata(metadata: &MetadataMap) -> Option<String> {
    metadata
        .get(TENANT_METADATA_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Extracts the caller's deadline from gRPC call metadata.
///
/// The wire format is an ASCII integer followed by a one-letter unit
/// (`H`, `M`, `S`, `m`, `u`, `n`). Returns `None` when the entry is absent
/// or malformed.
pub fn deadline_from_metadata(metadata: &MetadataMap) -> Option<Duration> {
    let value = metadata.get(GRPC_TIMEOUT_METADATA_KEY)?.to_str().ok()?;
    if value.len() < 2 || !value.is_ascii() {
        return None;
    }
    let (amount, unit) = value.split_at(value.len() - 1);
    let amount: u64 = amount.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(amount.checked_mul(3600)?)),
        "M" => Some(Duration::from_secs(amount.checked_mul(60)?)),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::metadata::MetadataValue;

    #[test]
    fn tenant_absent() {
        assert_eq!(tenant_from_metadata(&MetadataMap::new()), None);
    }

    #[test]
    fn tenant_empty_is_rejected() {
        let mut md = MetadataMap::new();
        md.insert(TENANT_METADATA_KEY, MetadataValue::from_static(""));
        assert_eq!(tenant_from_metadata(&md), None);
    }

    #[test]
    fn tenant_present() {
        let mut md = MetadataMap::new();
        md.insert(TENANT_METADATA_KEY, MetadataValue::from_static("team-a"));
        assert_eq!(tenant_from_metadata(&md), Some("team-a".to_owned()));
    }

    #[test]
    fn deadline_absent() {
        assert_eq!(deadline_from_metadata(&MetadataMap::new()), None);
    }

    #[test]
    fn deadline_parses_each_unit() {
        let cases = [
            ("1H", Duration::from_secs(3600)),
            ("2M", Duration::from_secs(120)),
            ("5S", Duration::from_secs(5)),
            ("200m", Duration::from_millis(200)),
            ("750u", Duration::from_micros(750)),
            ("100n", Duration::from_nanos(100)),
        ];
        for (raw, expected) in cases {
            let mut md = MetadataMap::new();
            md.insert(GRPC_TIMEOUT_METADATA_KEY, MetadataValue::from_static(raw));
            assert_eq!(deadline_from_metadata(&md), Some(expected), "value {raw}");
        }
    }

    #[test]
    fn deadline_rejects_malformed_values() {
        for raw in ["", "m", "200", "200x", "-5S", "bogus"] {
            let mut md = MetadataMap::new();
            md.insert(GRPC_TIMEOUT_METADATA_KEY, MetadataValue::from_static(raw));
            assert_eq!(deadline_from_metadata(&md), None, "value {raw:?}");
        }
    }
}
