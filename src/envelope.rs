//! Envelope helpers shared by the worker pool and the media dispatcher.
//!
//! Every published message is a JSON object carrying the platform default
//! headers plus schema-specific fields. The shaper validates presence of the
//! required fields per request kind; a validation failure is a local error
//! returned to the caller, never published.

use crate::broker::{EXCHANGE_CALLEVT, EXCHANGE_CALLMGR};
use crate::{Error, SbResult};
use serde_json::{Map, Value};

pub const APP_NAME: &str = "switchboard";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Header naming the reply address of the message's origin.
pub const SERVER_ID: &str = "Server-ID";

/// The outbound request kinds served by the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    AuthReq,
    RouteReq,
    RegQuery,
    MediaReq,
}

impl RequestKind {
    pub fn name(self) -> &'static str {
        match self {
            RequestKind::AuthReq => "auth_req",
            RequestKind::RouteReq => "route_req",
            RequestKind::RegQuery => "reg_query",
            RequestKind::MediaReq => "media_req",
        }
    }

    pub fn category(self) -> &'static str {
        match self {
            RequestKind::AuthReq | RequestKind::RegQuery => "directory",
            RequestKind::RouteReq => "dialplan",
            RequestKind::MediaReq => "media",
        }
    }

    /// Fields the shaper insists on beyond the injected default headers.
    pub fn required(self) -> &'static [&'static str] {
        match self {
            RequestKind::AuthReq => &["Msg-ID", "To"],
            RequestKind::RouteReq => &["Msg-ID", "To", "From", "Call-ID"],
            RequestKind::RegQuery => &["Msg-ID", "Username", "Realm"],
            RequestKind::MediaReq => &["Media-Name", SERVER_ID],
        }
    }

    /// Where the kind publishes: `(exchange, routing_key)`. The three
    /// call-manager kinds route under their own name; media requests ride
    /// the call-event exchange under the media binding.
    pub fn publish_target(self) -> (&'static str, &'static str) {
        match self {
            RequestKind::AuthReq | RequestKind::RouteReq | RequestKind::RegQuery => {
                (EXCHANGE_CALLMGR, self.name())
            }
            RequestKind::MediaReq => (EXCHANGE_CALLEVT, "media_req"),
        }
    }
}

/// Inject the platform default headers, leaving caller-supplied values alone.
pub fn set_default_headers(payload: &mut Map<String, Value>, category: &str, name: &str) {
    let defaults = [
        ("App-Name", APP_NAME),
        ("App-Version", APP_VERSION),
        ("Event-Category", category),
        ("Event-Name", name),
    ];
    for (key, value) in defaults {
        payload
            .entry(key.to_string())
            .or_insert_with(|| Value::String(value.to_string()));
    }
}

/// Shape an outbound request: inject default headers, then validate the
/// kind's required fields. Returns the payload ready for serialization.
pub fn shape(kind: RequestKind, mut payload: Map<String, Value>) -> SbResult<Map<String, Value>> {
    set_default_headers(&mut payload, kind.category(), kind.name());
    for field in kind.required() {
        match payload.get(*field) {
            Some(value) if !value.is_null() => {}
            _ => return Err(Error::EnvelopeInvalid(kind.name())),
        }
    }
    Ok(payload)
}

/// Error codes reported back to a media requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaErrorCode {
    NotFound,
    NoData,
    Other,
}

impl MediaErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaErrorCode::NotFound => "not_found",
            MediaErrorCode::NoData => "no_data",
            MediaErrorCode::Other => "other",
        }
    }
}

/// Build the error envelope published to a requester's `Server-ID` on the
/// targeted exchange.
pub fn media_error(
    media_name: &str,
    code: MediaErrorCode,
    error_msg: Option<&str>,
) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert(
        "Media-Name".to_string(),
        Value::String(media_name.to_string()),
    );
    payload.insert(
        "Error-Code".to_string(),
        Value::String(code.as_str().to_string()),
    );
    if let Some(msg) = error_msg {
        payload.insert("Error-Msg".to_string(), Value::String(msg.to_string()));
    }
    set_default_headers(&mut payload, "media", "media_error");
    payload
}

/// A parsed `Media-Name`: `[ "/" ] [ db "/" ] doc [ "/" attachment ]`.
///
/// A missing `db` means the configured default media database; a missing
/// attachment means the first attachment in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaName {
    pub db: Option<String>,
    pub doc: String,
    pub attachment: Option<String>,
}

/// Split a `Media-Name` per the grammar. Anything outside the grammar is
/// a [`Error::NotFound`], reported back to the requester rather than raised.
pub fn parse_media_name(raw: &str) -> SbResult<MediaName> {
    let mut parts: Vec<&str> = raw.split('/').collect();
    // A leading `/` produces an empty head token; tolerate it.
    while parts.first() == Some(&"") {
        parts.remove(0);
    }
    if parts.iter().any(|p| p.is_empty()) {
        return Err(Error::NotFound);
    }
    match parts.as_slice() {
        [doc] => Ok(MediaName {
            db: None,
            doc: doc.to_string(),
            attachment: None,
        }),
        [db, doc] => Ok(MediaName {
            db: Some(db.to_string()),
            doc: doc.to_string(),
            attachment: None,
        }),
        [db, doc, attachment] => Ok(MediaName {
            db: Some(db.to_string()),
            doc: doc.to_string(),
            attachment: Some(attachment.to_string()),
        }),
        _ => Err(Error::NotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn shape_injects_defaults_and_accepts_minimal_auth_req() {
        let payload = obj(json!({"Msg-ID": "m1", "To": "u@d"}));
        let shaped = shape(RequestKind::AuthReq, payload).unwrap();
        assert_eq!(shaped["Event-Category"], "directory");
        assert_eq!(shaped["Event-Name"], "auth_req");
        assert_eq!(shaped["App-Name"], APP_NAME);
        assert_eq!(shaped["Msg-ID"], "m1");
    }

    #[test]
    fn shape_rejects_missing_required_fields() {
        let err = shape(RequestKind::RouteReq, Map::new()).unwrap_err();
        assert!(matches!(err, Error::EnvelopeInvalid("route_req")));
    }

    #[test]
    fn shape_keeps_caller_supplied_headers() {
        let payload = obj(json!({
            "Msg-ID": "m2",
            "Username": "alice",
            "Realm": "example.com",
            "App-Name": "upstream"
        }));
        let shaped = shape(RequestKind::RegQuery, payload).unwrap();
        assert_eq!(shaped["App-Name"], "upstream");
    }

    #[test]
    fn publish_targets() {
        assert_eq!(
            RequestKind::AuthReq.publish_target(),
            (EXCHANGE_CALLMGR, "auth_req")
        );
        assert_eq!(
            RequestKind::MediaReq.publish_target(),
            (EXCHANGE_CALLEVT, "media_req")
        );
    }

    #[test]
    fn media_name_grammar() {
        assert_eq!(
            parse_media_name("greeting.wav").unwrap(),
            MediaName {
                db: None,
                doc: "greeting.wav".to_string(),
                attachment: None
            }
        );
        assert_eq!(
            parse_media_name("/tones/busy").unwrap(),
            MediaName {
                db: Some("tones".to_string()),
                doc: "busy".to_string(),
                attachment: None
            }
        );
        assert_eq!(
            parse_media_name("tones/busy/uk.wav").unwrap(),
            MediaName {
                db: Some("tones".to_string()),
                doc: "busy".to_string(),
                attachment: Some("uk.wav".to_string())
            }
        );
        assert!(parse_media_name("").is_err());
        assert!(parse_media_name("a/b/c/d").is_err());
        assert!(parse_media_name("a//c").is_err());
    }

    #[test]
    fn media_error_envelope() {
        let env = media_error("greeting.wav", MediaErrorCode::NoData, Some("no attachments"));
        assert_eq!(env["Error-Code"], "no_data");
        assert_eq!(env["Error-Msg"], "no attachments");
        assert_eq!(env["Event-Name"], "media_error");
        assert_eq!(env["Media-Name"], "greeting.wav");
    }
}
