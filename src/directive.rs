//! Start-directive extraction from shadow documents.
//!
//! A tunnel start is requested by writing desired state to the device shadow.
//! The same directive can reach the agent two ways with different nesting:
//!
//! - **Delta** push — the changed desired fields are inlined directly under
//!   `state`, with the field timestamp under `metadata.tunnel_lifetime.timestamp`.
//! - **Get-accepted** response — fields live under `state.desired`, timestamp
//!   under `metadata.desired.tunnel_lifetime.timestamp`.
//!
//! Extraction is all-or-nothing: the `tunnel` field must equal `"start"` and
//! all companion fields plus the metadata timestamp must be present, otherwise
//! the document is not a start directive. That is a normal negative outcome,
//! not an error — partial directives are never acted upon.

use serde_json::Value;

/// The literal desired-state value that marks a start directive.
pub const START_MARKER: &str = "start";

/// Which shadow document shape a payload was delivered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    /// `update/delta` push — desired fields inlined under `state`.
    Delta,
    /// `get/accepted` response — desired fields under `state.desired`.
    GetAccepted,
}

/// A validated instruction to start a tunnel. Transient: parsed, acted upon,
/// discarded.
#[derive(Clone, PartialEq)]
pub struct TunnelDirective {
    /// Destination access token for the proxy. Secret — redacted from `Debug`.
    pub access_token: String,
    /// Lease duration as authored, in minutes.
    pub tunnel_lifetime: i64,
    /// Region the tunnel was brokered in.
    pub region: String,
    /// Target `host:port` the destination proxy forwards to.
    pub endpoint: String,
    /// Epoch seconds at which the directive was authored upstream.
    pub desired_timestamp: i64,
}

impl std::fmt::Debug for TunnelDirective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelDirective")
            .field("access_token", &"***")
            .field("tunnel_lifetime", &self.tunnel_lifetime)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("desired_timestamp", &self.desired_timestamp)
            .finish()
    }
}

/// Extract a start directive from a decoded shadow document.
///
/// Returns `None` whenever the document is not a complete start directive,
/// regardless of which field is missing or mismatched.
pub fn extract(doc: &Value, kind: DocumentKind) -> Option<TunnelDirective> {
    let (state, metadata) = match kind {
        DocumentKind::Delta => (doc.get("state")?, doc.get("metadata")?),
        DocumentKind::GetAccepted => (
            doc.get("state")?.get("desired")?,
            doc.get("metadata")?.get("desired")?,
        ),
    };

    if state.get("tunnel")?.as_str()? != START_MARKER {
        return None;
    }

    Some(TunnelDirective {
        access_token: state.get("access_token")?.as_str()?.to_string(),
        tunnel_lifetime: state.get("tunnel_lifetime")?.as_i64()?,
        region: state.get("region")?.as_str()?.to_string(),
        endpoint: state.get("endpoint")?.as_str()?.to_string(),
        desired_timestamp: metadata
            .get("tunnel_lifetime")?
            .get("timestamp")?
            .as_i64()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta_doc() -> Value {
        json!({
            "state": {
                "tunnel": "start",
                "access_token": "AT1",
                "tunnel_lifetime": 60,
                "region": "eu-west-1",
                "endpoint": "10.0.0.5:22",
            },
            "metadata": {
                "tunnel_lifetime": { "timestamp": 1_700_000_000 }
            }
        })
    }

    fn get_accepted_doc() -> Value {
        json!({
            "state": {
                "desired": {
                    "tunnel": "start",
                    "access_token": "AT1",
                    "tunnel_lifetime": 60,
                    "region": "eu-west-1",
                    "endpoint": "10.0.0.5:22",
                },
                "reported": { "status": "ready" }
            },
            "metadata": {
                "desired": {
                    "tunnel_lifetime": { "timestamp": 1_700_000_000 }
                }
            }
        })
    }

    #[test]
    fn test_extract_from_delta() {
        let d = extract(&delta_doc(), DocumentKind::Delta).unwrap();
        assert_eq!(d.access_token, "AT1");
        assert_eq!(d.tunnel_lifetime, 60);
        assert_eq!(d.region, "eu-west-1");
        assert_eq!(d.endpoint, "10.0.0.5:22");
        assert_eq!(d.desired_timestamp, 1_700_000_000);
    }

    #[test]
    fn test_delta_and_get_accepted_yield_same_directive() {
        let from_delta = extract(&delta_doc(), DocumentKind::Delta).unwrap();
        let from_get = extract(&get_accepted_doc(), DocumentKind::GetAccepted).unwrap();
        assert_eq!(from_delta, from_get);
    }

    #[test]
    fn test_missing_region_is_not_a_directive() {
        let mut doc = delta_doc();
        doc["state"].as_object_mut().unwrap().remove("region");
        assert!(extract(&doc, DocumentKind::Delta).is_none());
    }

    #[test]
    fn test_wrong_marker_is_not_a_directive() {
        let mut doc = delta_doc();
        doc["state"]["tunnel"] = json!("stop");
        assert!(extract(&doc, DocumentKind::Delta).is_none());
    }

    #[test]
    fn test_missing_metadata_timestamp_is_not_a_directive() {
        let mut doc = delta_doc();
        doc["metadata"] = json!({});
        assert!(extract(&doc, DocumentKind::Delta).is_none());
    }

    #[test]
    fn test_kind_nesting_is_not_interchangeable() {
        // A delta-shaped document read as get-accepted has no state.desired.
        assert!(extract(&delta_doc(), DocumentKind::GetAccepted).is_none());
        assert!(extract(&get_accepted_doc(), DocumentKind::Delta).is_none());
    }

    #[test]
    fn test_debug_redacts_access_token() {
        let d = extract(&delta_doc(), DocumentKind::Delta).unwrap();
        let rendered = format!("{d:?}");
        assert!(!rendered.contains("AT1"));
        assert!(rendered.contains("***"));
    }
}
