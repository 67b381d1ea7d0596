use serde_json::{Map, Value};

use crate::ProtocolError;

/// The logical message exchanged over every transport.
///
/// Decoding is lenient: a field with the wrong JSON type degrades to its
/// default instead of failing, so a partially valid message still reaches the
/// dispatcher, which then applies its own structural rules.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Envelope {
    pub kind: String,
    pub data: Map<String, Value>,
    pub client: String,
    pub process: Option<String>,
}

impl Envelope {
    pub fn new(
        kind: impl Into<String>,
        data: Map<String, Value>,
        client: impl Into<String>,
        process: Option<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            data,
            client: client.into(),
            process,
        }
    }

    /// Build an event addressed to the same client and process as `self`.
    pub fn reply(&self, kind: impl Into<String>, data: Map<String, Value>) -> Self {
        Self::new(kind, data, self.client.clone(), self.process.clone())
    }

    pub fn encode(&self) -> String {
        let mut root = Map::new();
        root.insert("type".to_string(), Value::String(self.kind.clone()));
        root.insert("data".to_string(), Value::Object(self.data.clone()));
        root.insert("client".to_string(), Value::String(self.client.clone()));
        root.insert(
            "process".to_string(),
            self.process
                .as_ref()
                .map_or(Value::Null, |p| Value::String(p.clone())),
        );
        Value::Object(root).to_string()
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ProtocolError::BadMessage(e.to_string()))?;
        let Value::Object(mut root) = value else {
            return Err(ProtocolError::BadMessage(
                "message is not an object".to_string(),
            ));
        };

        let kind = match root.remove("type") {
            Some(Value::String(s)) => s,
            _ => String::new(),
        };
        let data = match root.remove("data") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let client = match root.remove("client") {
            Some(Value::String(s)) => s,
            _ => String::new(),
        };
        let process = match root.remove("process") {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };

        Ok(Self {
            kind,
            data,
            client,
            process,
        })
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(Value::as_bool)
    }

    pub fn u16_field(&self, key: &str) -> Option<u16> {
        self.data
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u16::try_from(v).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let env = Envelope::new(
            "start",
            data(json!({"runner": "python3", "code": "print(1)", "pty": true})),
            "client-1",
            Some("proc-a".to_string()),
        );
        let wire = env.encode();
        assert_eq!(Envelope::decode(&wire).unwrap(), env);
    }

    #[test]
    fn roundtrip_without_process() {
        let env = Envelope::new("ping", Map::new(), "c", None);
        let parsed = Envelope::decode(&env.encode()).unwrap();
        assert_eq!(parsed, env);
        assert!(env.encode().contains(r#""process":null"#));
    }

    #[test]
    fn mistyped_fields_degrade_to_defaults() {
        let parsed =
            Envelope::decode(r#"{"type": 5, "data": "nope", "client": [], "process": 7}"#)
                .unwrap();
        assert_eq!(parsed.kind, "");
        assert!(parsed.data.is_empty());
        assert_eq!(parsed.client, "");
        assert_eq!(parsed.process, None);
    }

    #[test]
    fn missing_fields_degrade_to_defaults() {
        let parsed = Envelope::decode("{}").unwrap();
        assert_eq!(parsed, Envelope::default());
    }

    #[test]
    fn null_data_becomes_empty_map() {
        let parsed = Envelope::decode(r#"{"type":"ping","data":null}"#).unwrap();
        assert_eq!(parsed.kind, "ping");
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn unparsable_payload_is_bad_message() {
        assert!(matches!(
            Envelope::decode("{not json"),
            Err(ProtocolError::BadMessage(_))
        ));
        assert!(matches!(
            Envelope::decode("[1, 2]"),
            Err(ProtocolError::BadMessage(_))
        ));
    }

    #[test]
    fn reply_keeps_client_and_process() {
        let cmd = Envelope::new("ping", Map::new(), "web", Some("p1".to_string()));
        let reply = cmd.reply("pong", Map::new());
        assert_eq!(reply.kind, "pong");
        assert_eq!(reply.client, "web");
        assert_eq!(reply.process.as_deref(), Some("p1"));
    }

    #[test]
    fn typed_field_accessors() {
        let env = Envelope::new(
            "resize",
            data(json!({"rows": 24, "cols": 70000, "input": "x", "pty": false})),
            "",
            None,
        );
        assert_eq!(env.u16_field("rows"), Some(24));
        assert_eq!(env.u16_field("cols"), None);
        assert_eq!(env.str_field("input"), Some("x"));
        assert_eq!(env.bool_field("pty"), Some(false));
        assert_eq!(env.str_field("rows"), None);
    }
}
