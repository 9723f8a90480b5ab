use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::scores::Scores;

const SCORE_FIELDS: [&str; 4] = ["attention", "stability", "smoothness", "confidence"];

/// Terminal message: authoritative final scores plus whatever else the scorer
/// chose to report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    #[serde(flatten)]
    pub scores: Scores,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryMessage {
    Realtime(Scores),
    FinalReport(FinalReport),
}

impl TelemetryMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryMessage::Realtime(_) => "realtime",
            TelemetryMessage::FinalReport(_) => "final_report",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("inbound message is not JSON: {0}")]
    NotJson(String),
    #[error("inbound message is not a JSON object")]
    NotAnObject,
    #[error("inbound message has no string `type`")]
    MissingType,
    #[error("unknown inbound message type '{0}'")]
    UnknownType(String),
}

/// Decode one inbound text frame and dispatch on its `type` tag.
pub fn parse_message(text: &str) -> Result<TelemetryMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| ProtocolError::NotJson(err.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    let kind = match object.remove("type") {
        Some(Value::String(kind)) => kind,
        _ => return Err(ProtocolError::MissingType),
    };

    match kind.as_str() {
        "realtime" => Ok(TelemetryMessage::Realtime(scores_from(&object))),
        "final_report" => {
            let scores = scores_from(&object);
            for field in SCORE_FIELDS {
                object.remove(field);
            }
            Ok(TelemetryMessage::FinalReport(FinalReport {
                scores,
                extra: object,
            }))
        }
        _ => Err(ProtocolError::UnknownType(kind)),
    }
}

fn scores_from(object: &Map<String, Value>) -> Scores {
    let mut subset = Map::new();
    for field in SCORE_FIELDS {
        if let Some(value) = object.get(field) {
            subset.insert(field.to_string(), value.clone());
        }
    }
    // Every field is lenient and defaulted, so this cannot fail on a map.
    serde_json::from_value::<Scores>(Value::Object(subset))
        .unwrap_or_default()
        .sanitized()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_realtime_with_missing_fields() {
        let message = parse_message(r#"{"type":"realtime","attention":80,"confidence":64.5}"#)
            .unwrap();
        assert_eq!(
            message,
            TelemetryMessage::Realtime(Scores::new(80.0, 0.0, 0.0, 64.5))
        );
    }

    #[test]
    fn final_report_keeps_extra_fields() {
        let message = parse_message(
            r#"{"type":"final_report","attention":70,"stability":60,"smoothness":50,"confidence":40,"frames":812,"feedback":"steady"}"#,
        )
        .unwrap();

        let TelemetryMessage::FinalReport(report) = message else {
            panic!("expected final report");
        };
        assert_eq!(report.scores, Scores::new(70.0, 60.0, 50.0, 40.0));
        assert_eq!(report.extra.get("frames"), Some(&Value::from(812)));
        assert_eq!(report.extra.get("feedback"), Some(&Value::from("steady")));
        assert!(!report.extra.contains_key("attention"));
    }

    #[test]
    fn realtime_values_are_clamped() {
        let message =
            parse_message(r#"{"type":"realtime","attention":180,"stability":-3}"#).unwrap();
        assert_eq!(
            message,
            TelemetryMessage::Realtime(Scores::new(100.0, 0.0, 0.0, 0.0))
        );
    }

    #[test]
    fn rejects_malformed_messages() {
        assert!(matches!(
            parse_message("not json"),
            Err(ProtocolError::NotJson(_))
        ));
        assert_eq!(parse_message("[1,2]"), Err(ProtocolError::NotAnObject));
        assert_eq!(
            parse_message(r#"{"attention":1}"#),
            Err(ProtocolError::MissingType)
        );
        assert_eq!(
            parse_message(r#"{"type":"heartbeat"}"#),
            Err(ProtocolError::UnknownType("heartbeat".into()))
        );
    }

    #[test]
    fn protocol_errors_describe_the_frame() {
        assert_eq!(
            ProtocolError::UnknownType("heartbeat".into()).to_string(),
            "unknown inbound message type 'heartbeat'"
        );
        let err: anyhow::Error = parse_message("[]").unwrap_err().into();
        assert_eq!(err.to_string(), "inbound message is not a JSON object");
        assert_eq!(parse_message(r#"{"type":"realtime"}"#).unwrap().kind(), "realtime");
    }

    #[test]
    fn final_report_serializes_flat() {
        let report = FinalReport {
            scores: Scores::new(1.0, 2.0, 3.0, 4.0),
            extra: Map::new(),
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["attention"], Value::from(1.0));
        assert_eq!(value["confidence"], Value::from(4.0));
    }
}
