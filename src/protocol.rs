// protocol.rs — the pipe's wire schema (§6). Inbound commands are matched
// ad-hoc against a parsed `serde_json::Value` rather than a closed `enum`
// (spec.md's own budget table names C9 as "ad-hoc JSON dispatch", and a
// strongly-typed enum would reject unknown variants instead of the
// required "ignored" behaviour, §7). Outbound events use a typed,
// `#[serde(untagged)]` enum so the two shapes — a snapshot array and a
// named diagnostic object — serialize exactly as §6 describes without a
// wrapper tag polluting the wire format.

use crate::creature_map::CreatureSnapshot;
use serde::Serialize;
use serde_json::Value;

#[derive(Serialize)]
pub struct CreatureRow {
    pub id: u32,
    pub name: String,
    pub hp: u8,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl From<&CreatureSnapshot> for CreatureRow {
    fn from(s: &CreatureSnapshot) -> Self {
        Self {
            id: s.id,
            name: s.name.clone(),
            hp: s.hp,
            x: s.pos.x,
            y: s.pos.y,
            z: s.pos.z,
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum OutboundEvent {
    Snapshot(Vec<CreatureRow>),
    Diagnostic(Value),
}

pub fn snapshot_event(rows: &[CreatureSnapshot]) -> OutboundEvent {
    OutboundEvent::Snapshot(rows.iter().map(CreatureRow::from).collect())
}

pub fn diagnostic_event(name: &str, fields: Value) -> OutboundEvent {
    let mut obj = serde_json::Map::new();
    obj.insert("diag".to_string(), Value::String(name.to_string()));
    if let Value::Object(map) = fields {
        obj.extend(map);
    }
    OutboundEvent::Diagnostic(Value::Object(obj))
}

/// A single parsed inbound command line. `cmd` is required; every other
/// field is read ad-hoc by the dispatcher (§7: "Unknown command or
/// malformed JSON — ignored").
pub fn parse_command(line: &str) -> Option<(String, Value)> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let cmd = value.get("cmd")?.as_str()?.to_string();
    Some((cmd, value))
}

pub fn field_u32(value: &Value, key: &str) -> Option<u32> {
    value.get(key).and_then(|v| {
        v.as_u64()
            .map(|n| n as u32)
            .or_else(|| v.as_str().and_then(|s| parse_hex_or_dec(s)))
    })
}

pub fn field_bool(value: &Value, key: &str) -> Option<bool> {
    value.get(key).and_then(|v| v.as_bool())
}

pub fn field_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

fn parse_hex_or_dec(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_command() {
        let (cmd, value) = parse_command(r#"{"cmd":"init","player_id":1073741825}"#).unwrap();
        assert_eq!(cmd, "init");
        assert_eq!(field_u32(&value, "player_id"), Some(1073741825));
    }

    #[test]
    fn missing_cmd_field_yields_none() {
        assert!(parse_command(r#"{"player_id":1}"#).is_none());
    }

    #[test]
    fn malformed_json_yields_none() {
        assert!(parse_command("{not json").is_none());
    }

    #[test]
    fn field_u32_accepts_hex_string() {
        let value: Value = serde_json::from_str(r#"{"addr":"0x00500000"}"#).unwrap();
        assert_eq!(field_u32(&value, "addr"), Some(0x0050_0000));
    }

    #[test]
    fn unknown_fields_do_not_break_parsing() {
        let (cmd, _) = parse_command(r#"{"cmd":"stop","bogus":true}"#).unwrap();
        assert_eq!(cmd, "stop");
    }
}
