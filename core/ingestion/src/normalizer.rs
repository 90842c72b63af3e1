use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use contact_hub_schemas::{
    synthesize_message_id, Attachment, Channel, InboundEvent, Peer,
};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::HubError;

// Ordered candidate field names per logical field. Upstream scrapers are
// inconsistent about naming, so each field is resolved by one
// case-insensitive lookup over its candidates.
const CHANNEL_FIELDS: &[&str] = &["channel", "service", "app", "platform"];
const PEER_OBJECT_FIELDS: &[&str] = &["peer", "sender", "contact"];
const HANDLE_FIELDS: &[&str] = &["handle", "sender", "from", "address", "phone", "email"];
const PEER_ID_FIELDS: &[&str] = &["peer_id", "sender_id", "contact_id"];
const DISPLAY_NAME_FIELDS: &[&str] = &["display_name", "displayname", "sender_name", "name"];
const TEXT_FIELDS: &[&str] = &["text", "message", "body", "content"];
const TIMESTAMP_FIELDS: &[&str] = &["timestamp", "ts", "date", "time", "sent_at", "created_at"];
const MESSAGE_ID_FIELDS: &[&str] = &["message_id", "msg_id", "guid", "uid"];
const ATTACHMENT_FIELDS: &[&str] = &["attachments", "files", "media"];

/// Epoch values at or above this magnitude are milliseconds, below are
/// seconds (10^12 seconds is past year 33000).
const EPOCH_MILLIS_THRESHOLD: f64 = 1e12;

/// Turn an arbitrary inbound payload into a canonical [`InboundEvent`].
///
/// Pure function, no I/O. Fails with `HubError::Validation` when the channel
/// is missing or unresolvable, the peer handle is empty after cleanup, or
/// both text and usable attachments are absent.
pub fn normalize(raw: &Value) -> Result<InboundEvent, HubError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| HubError::validation("payload is not a JSON object"))?;

    let channel_name = pick_str(obj, CHANNEL_FIELDS)
        .ok_or_else(|| HubError::validation("payload has no channel field"))?;
    let channel = Channel::from_alias(&channel_name)
        .ok_or_else(|| HubError::validation(format!("unsupported channel '{}'", channel_name)))?;

    let peer_obj = PEER_OBJECT_FIELDS
        .iter()
        .find_map(|name| pick(obj, &[*name]).and_then(Value::as_object));

    let raw_handle = peer_obj
        .and_then(|p| pick_str(p, &["handle", "id", "address", "phone", "email"]))
        .or_else(|| pick_str(obj, HANDLE_FIELDS))
        .unwrap_or_default();
    let handle = clean_handle(channel, &raw_handle);
    if handle.is_empty() {
        return Err(HubError::validation(format!(
            "peer handle missing or empty after cleanup for channel '{}'",
            channel
        )));
    }

    let peer_id = peer_obj
        .and_then(|p| pick_str(p, &["id"]))
        .or_else(|| pick_str(obj, PEER_ID_FIELDS));
    let display_name = peer_obj
        .and_then(|p| pick_str(p, DISPLAY_NAME_FIELDS))
        .or_else(|| pick_str(obj, DISPLAY_NAME_FIELDS));

    let timestamp = parse_timestamp(pick(obj, TIMESTAMP_FIELDS));

    let text = pick_str(obj, TEXT_FIELDS).unwrap_or_default();

    let attachments = pick(obj, ATTACHMENT_FIELDS)
        .and_then(Value::as_array)
        .map(|items| normalize_attachments(items))
        .unwrap_or_default();

    if text.is_empty() && attachments.is_empty() {
        return Err(HubError::validation(
            "event has neither text nor usable attachments",
        ));
    }

    let message_id = match pick_str(obj, MESSAGE_ID_FIELDS) {
        Some(id) => id,
        None => {
            let attachment_ids: Vec<String> = attachments
                .iter()
                .filter_map(|a| a.id.clone().or_else(|| a.url.clone()).or_else(|| a.name.clone()))
                .collect();
            synthesize_message_id(channel, &handle, &timestamp, &text, &attachment_ids)
        }
    };

    Ok(InboundEvent {
        channel,
        peer: Peer {
            id: peer_id,
            handle,
            display_name,
        },
        message_id,
        text,
        timestamp,
        attachments,
    })
}

/// Case-insensitive lookup of the first present candidate field.
fn pick<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    for name in names {
        if let Some(value) = obj
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
        {
            if !value.is_null() {
                return Some(value);
            }
        }
    }
    None
}

/// Like [`pick`], coerced to a trimmed non-empty string. Numbers are
/// accepted (phone handles and ids often arrive as JSON numbers).
fn pick_str(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    for name in names {
        let Some(value) = obj
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
        else {
            continue;
        };
        match value {
            Value::String(s) if !s.trim().is_empty() => return Some(s.trim().to_string()),
            Value::Number(n) => return Some(n.to_string()),
            _ => continue,
        }
    }
    None
}

/// Channel-specific handle cleanup: scheme-prefix strip, provider-suffix
/// strip, case-folding where identity is case-insensitive.
fn clean_handle(channel: Channel, raw: &str) -> String {
    let mut handle = raw.trim().to_string();

    for scheme in [
        "imessage:", "sms:", "tel:", "mailto:", "whatsapp:", "signal:", "telegram:", "linkedin:",
    ] {
        let stripped = handle
            .get(..scheme.len())
            .filter(|prefix| prefix.eq_ignore_ascii_case(scheme))
            .map(|_| handle[scheme.len()..].trim_start_matches("//").to_string());
        if let Some(rest) = stripped {
            handle = rest;
            break;
        }
    }

    for suffix in ["@s.whatsapp.net", "@c.us", "@g.us"] {
        let Some(start) = handle.len().checked_sub(suffix.len()) else {
            continue;
        };
        let matches_suffix = handle
            .get(start..)
            .map(|tail| tail.eq_ignore_ascii_case(suffix))
            .unwrap_or(false);
        if matches_suffix {
            handle.truncate(start);
            break;
        }
    }

    handle = handle.trim().to_string();
    if channel.case_insensitive_identity() {
        handle = handle.to_lowercase();
    }
    handle
}

/// Timestamp parsing order: nested date object, RFC3339/ISO string, numeric
/// epoch (seconds vs milliseconds by magnitude), numeric string, a handful
/// of lenient date formats, and finally the current time.
fn parse_timestamp(value: Option<&Value>) -> String {
    let now = || Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let Some(value) = value else {
        return now();
    };

    match value {
        Value::Object(inner) => {
            // Scrapers sometimes wrap the stamp ({"iso": "..."}, {"$date": ...})
            if let Some(nested) = pick(inner, &["iso", "$date", "value", "date"]) {
                parse_timestamp(Some(nested))
            } else {
                now()
            }
        }
        Value::Number(n) => n
            .as_f64()
            .and_then(epoch_to_rfc3339)
            .unwrap_or_else(now),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return dt
                    .with_timezone(&Utc)
                    .to_rfc3339_opts(SecondsFormat::Secs, true);
            }
            if let Ok(n) = s.parse::<f64>() {
                if let Some(ts) = epoch_to_rfc3339(n) {
                    return ts;
                }
            }
            for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%m/%d/%Y %H:%M"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Utc
                        .from_utc_datetime(&naive)
                        .to_rfc3339_opts(SecondsFormat::Secs, true);
                }
            }
            for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
                if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
                    if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                        return Utc
                            .from_utc_datetime(&naive)
                            .to_rfc3339_opts(SecondsFormat::Secs, true);
                    }
                }
            }
            debug!("Unparseable timestamp '{}', falling back to now", s);
            now()
        }
        _ => now(),
    }
}

fn epoch_to_rfc3339(value: f64) -> Option<String> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    let millis = if value >= EPOCH_MILLIS_THRESHOLD {
        value as i64
    } else {
        (value * 1000.0) as i64
    };
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Normalize raw attachment items to the fixed shape, silently dropping
/// items that resolve to no usable field.
fn normalize_attachments(items: &[Value]) -> Vec<Attachment> {
    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let attachment = Attachment {
                id: pick_str(obj, &["id", "attachment_id", "guid"]),
                kind: pick_str(obj, &["kind", "type"]).unwrap_or_else(|| "file".to_string()),
                name: pick_str(obj, &["name", "filename", "file_name", "title"]),
                url: pick_str(obj, &["url", "uri", "link"]),
                mime_type: pick_str(obj, &["mime_type", "mimetype", "content_type", "mime"]),
                size: pick(obj, &["size", "bytes", "file_size"]).and_then(Value::as_u64),
            };
            attachment.is_usable().then_some(attachment)
        })
        .collect()
}
