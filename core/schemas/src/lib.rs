use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

// ============================================================================
// ULID and ID Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NoteId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SuggestionId(pub String);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SuggestionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Channel
// ============================================================================

/// A supported communication channel. Inbound payloads may name channels
/// loosely; resolution goes through [`Channel::from_alias`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "imessage")]
    Imessage,
    #[serde(rename = "sms")]
    Sms,
    #[serde(rename = "whatsapp")]
    Whatsapp,
    #[serde(rename = "telegram")]
    Telegram,
    #[serde(rename = "signal")]
    Signal,
    #[serde(rename = "email")]
    Email,
    #[serde(rename = "linkedin")]
    Linkedin,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Imessage => "imessage",
            Channel::Sms => "sms",
            Channel::Whatsapp => "whatsapp",
            Channel::Telegram => "telegram",
            Channel::Signal => "signal",
            Channel::Email => "email",
            Channel::Linkedin => "linkedin",
        }
    }

    /// Human-readable label used as the document `source` field.
    pub fn label(&self) -> &'static str {
        match self {
            Channel::Imessage => "iMessage",
            Channel::Sms => "SMS",
            Channel::Whatsapp => "WhatsApp",
            Channel::Telegram => "Telegram",
            Channel::Signal => "Signal",
            Channel::Email => "Email",
            Channel::Linkedin => "LinkedIn",
        }
    }

    /// URI scheme used when building a document `path`.
    pub fn scheme(&self) -> &'static str {
        self.as_str()
    }

    /// Resolve a loosely spelled channel name through the alias table.
    /// Matching is case-insensitive and tolerant of surrounding whitespace.
    pub fn from_alias(name: &str) -> Option<Channel> {
        match name.trim().to_lowercase().as_str() {
            "imessage" | "imsg" | "applemessages" | "apple-messages" | "messages" => {
                Some(Channel::Imessage)
            }
            "sms" | "txt" | "text" | "mms" => Some(Channel::Sms),
            "whatsapp" | "wa" => Some(Channel::Whatsapp),
            "telegram" | "tg" => Some(Channel::Telegram),
            "signal" => Some(Channel::Signal),
            "email" | "mail" | "gmail" | "e-mail" => Some(Channel::Email),
            "linkedin" | "li" | "linkedin-messaging" => Some(Channel::Linkedin),
            _ => None,
        }
    }

    /// Whether peer identity on this channel is case-insensitive, in which
    /// case handles are folded to lowercase during normalization.
    pub fn case_insensitive_identity(&self) -> bool {
        matches!(self, Channel::Email | Channel::Linkedin)
    }

    /// Whether handles on this channel are phone numbers.
    pub fn phone_identity(&self) -> bool {
        matches!(
            self,
            Channel::Imessage | Channel::Sms | Channel::Whatsapp | Channel::Signal
        )
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Inbound Event Schema
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub id: Option<String>,
    pub handle: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_attachment_kind")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

fn default_attachment_kind() -> String {
    "file".to_string()
}

impl Attachment {
    /// An attachment carrying none of name/url/size/mime type is unusable
    /// and is dropped during normalization.
    pub fn is_usable(&self) -> bool {
        self.name.is_some() || self.url.is_some() || self.size.is_some() || self.mime_type.is_some()
    }
}

/// Canonical inbound message event, produced by the normalizer from an
/// arbitrary raw channel payload. Invariant: `text` non-empty or
/// `attachments` non-empty; `channel` always a supported member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub channel: Channel,
    pub peer: Peer,
    pub message_id: String,
    pub text: String,
    pub timestamp: String, // RFC3339
    pub attachments: Vec<Attachment>,
}

// ============================================================================
// Canonical Document Schema
// ============================================================================

/// The unit stored in the external search index. `id` is a pure function of
/// `(channel, message_id)` so redelivery maps to the same document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalDocument {
    pub id: String,
    pub text: String,
    pub source: String,
    pub path: String,
}

// ============================================================================
// Contact Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactStatus {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "draft")]
    Draft,
    #[serde(rename = "closed")]
    Closed,
}

impl ContactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactStatus::Open => "open",
            ContactStatus::Draft => "draft",
            ContactStatus::Closed => "closed",
        }
    }
}

impl Default for ContactStatus {
    fn default() -> Self {
        ContactStatus::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoteKind {
    #[serde(rename = "note")]
    Note,
    #[serde(rename = "link")]
    Link,
    #[serde(rename = "email")]
    Email,
    #[serde(rename = "phone")]
    Phone,
    #[serde(rename = "address")]
    Address,
    #[serde(rename = "hashtag")]
    Hashtag,
}

impl NoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteKind::Note => "note",
            NoteKind::Link => "link",
            NoteKind::Email => "email",
            NoteKind::Phone => "phone",
            NoteKind::Address => "address",
            NoteKind::Hashtag => "hashtag",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: NoteId,
    pub kind: NoteKind,
    pub value: String,
    pub text: String,
    pub timestamp: String, // RFC3339
    pub source: String,
}

/// What a pending suggestion proposes to add to a contact. `Emails` and
/// `Phones` fold into the channel lists on accept; the rest become notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuggestionKind {
    #[serde(rename = "emails")]
    Emails,
    #[serde(rename = "phones")]
    Phones,
    #[serde(rename = "links")]
    Links,
    #[serde(rename = "notes")]
    Notes,
    #[serde(rename = "addresses")]
    Addresses,
    #[serde(rename = "hashtags")]
    Hashtags,
}

impl SuggestionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionKind::Emails => "emails",
            SuggestionKind::Phones => "phones",
            SuggestionKind::Links => "links",
            SuggestionKind::Notes => "notes",
            SuggestionKind::Addresses => "addresses",
            SuggestionKind::Hashtags => "hashtags",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<SuggestionKind> {
        match s.trim().to_lowercase().as_str() {
            "emails" | "email" => Some(SuggestionKind::Emails),
            "phones" | "phone" => Some(SuggestionKind::Phones),
            "links" | "link" => Some(SuggestionKind::Links),
            "notes" | "note" => Some(SuggestionKind::Notes),
            "addresses" | "address" => Some(SuggestionKind::Addresses),
            "hashtags" | "hashtag" => Some(SuggestionKind::Hashtags),
            _ => None,
        }
    }

    /// The note kind an accepted non-channel suggestion turns into.
    pub fn note_kind(&self) -> NoteKind {
        match self {
            SuggestionKind::Emails => NoteKind::Email,
            SuggestionKind::Phones => NoteKind::Phone,
            SuggestionKind::Links => NoteKind::Link,
            SuggestionKind::Notes => NoteKind::Note,
            SuggestionKind::Addresses => NoteKind::Address,
            SuggestionKind::Hashtags => NoteKind::Hashtag,
        }
    }

    /// Channel-list suggestions (emails/phones) merge into
    /// `Contact::channels` instead of the note log.
    pub fn is_channel_list(&self) -> bool {
        matches!(self, SuggestionKind::Emails | SuggestionKind::Phones)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: SuggestionId,
    pub kind: SuggestionKind,
    pub content: String,
    pub timestamp: String, // RFC3339
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelHandles {
    #[serde(default)]
    pub phone: Vec<String>,
    #[serde(default)]
    pub email: Vec<String>,
}

/// One contact record per real-world person. Contacts are unique by
/// case-insensitive `handle` (or `display_name` when no handle exists) and
/// are never hard-deleted, only merged into another contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub handle: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub channels: ChannelHandles,
    #[serde(default)]
    pub last_contacted: Option<String>, // RFC3339
    #[serde(default)]
    pub last_channel: Option<String>,
    #[serde(default)]
    pub status: ContactStatus,
    #[serde(default)]
    pub draft: Option<String>,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub pending_suggestions: Vec<Suggestion>,
    #[serde(default)]
    pub rejected_suggestions: Vec<String>,
}

impl Contact {
    pub fn with_handle(handle: &str) -> Self {
        Contact {
            id: generate_contact_id(),
            display_name: String::new(),
            handle: handle.to_string(),
            aliases: Vec::new(),
            channels: ChannelHandles::default(),
            last_contacted: None,
            last_channel: None,
            status: ContactStatus::Open,
            draft: None,
            notes: Vec::new(),
            pending_suggestions: Vec::new(),
            rejected_suggestions: Vec::new(),
        }
    }

    /// The key this contact deduplicates under: lowercase handle, falling
    /// back to lowercase display name when no handle exists.
    pub fn identity_key(&self) -> String {
        if !self.handle.trim().is_empty() {
            self.handle.trim().to_lowercase()
        } else {
            self.display_name.trim().to_lowercase()
        }
    }
}

// ============================================================================
// Audit Record Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditStatus {
    #[serde(rename = "ingested")]
    Ingested,
    #[serde(rename = "duplicate")]
    Duplicate,
    #[serde(rename = "error")]
    Error,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Ingested => "ingested",
            AuditStatus::Duplicate => "duplicate",
            AuditStatus::Error => "error",
        }
    }
}

/// One line in the append-only ingestion audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub at: String, // RFC3339
    pub status: AuditStatus,
    pub channel: String,
    pub message_id: String,
    pub peer: String,
    pub doc: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

// ============================================================================
// Deterministic Ids and Content Hashing
// ============================================================================

/// Derive the canonical document id for an event. Pure function of
/// `(channel, message_id)` — never random — so redelivery of the same
/// message always maps to the same index row.
pub fn derive_document_id(channel: Channel, message_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(channel.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(message_id.as_bytes());
    let digest = hasher.finalize();
    format!("doc_{}", hex_prefix(&digest, 32))
}

/// Synthesize a stable message id for sources that supply none. Hashing the
/// event content means bit-identical redelivery yields the same id, which
/// keeps the pipeline idempotent even without a caller-assigned id.
pub fn synthesize_message_id(
    channel: Channel,
    handle: &str,
    timestamp: &str,
    text: &str,
    attachment_ids: &[String],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(channel.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(handle.as_bytes());
    hasher.update(b"\n");
    hasher.update(timestamp.as_bytes());
    hasher.update(b"\n");
    hasher.update(text.as_bytes());
    for id in attachment_ids {
        hasher.update(b"\n");
        hasher.update(id.as_bytes());
    }
    let digest = hasher.finalize();
    format!("syn_{}", hex_prefix(&digest, 32))
}

fn hex_prefix(digest: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in digest {
        if out.len() >= chars {
            break;
        }
        out.push_str(&format!("{:02x}", byte));
    }
    out.truncate(chars);
    out
}

/// Strip everything but digits from a phone-shaped handle. Used for the
/// digit-normalized lookup tier and channel-list dedup.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn generate_contact_id() -> ContactId {
    ContactId(format!("ct_{}", ulid::Ulid::new()))
}

pub fn generate_note_id() -> NoteId {
    NoteId(format!("note_{}", ulid::Ulid::new()))
}

pub fn generate_suggestion_id() -> SuggestionId {
    SuggestionId(format!("sug_{}", ulid::Ulid::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generation() {
        let contact_id = generate_contact_id();
        assert!(contact_id.0.starts_with("ct_"));
        assert_eq!(contact_id.0.len(), 29); // "ct_" + 26 chars

        let note_id = generate_note_id();
        assert!(note_id.0.starts_with("note_"));

        let suggestion_id = generate_suggestion_id();
        assert!(suggestion_id.0.starts_with("sug_"));
    }

    #[test]
    fn test_channel_alias_resolution() {
        assert_eq!(Channel::from_alias("imsg"), Some(Channel::Imessage));
        assert_eq!(Channel::from_alias(" TXT "), Some(Channel::Sms));
        assert_eq!(Channel::from_alias("WA"), Some(Channel::Whatsapp));
        assert_eq!(Channel::from_alias("Gmail"), Some(Channel::Email));
        assert_eq!(Channel::from_alias("linkedin-messaging"), Some(Channel::Linkedin));
        assert_eq!(Channel::from_alias("carrier-pigeon"), None);
        assert_eq!(Channel::from_alias(""), None);
    }

    #[test]
    fn test_channel_identity_shape() {
        assert!(Channel::Email.case_insensitive_identity());
        assert!(Channel::Linkedin.case_insensitive_identity());
        assert!(!Channel::Sms.case_insensitive_identity());
        assert!(Channel::Sms.phone_identity());
        assert!(Channel::Imessage.phone_identity());
        assert!(!Channel::Email.phone_identity());
    }

    #[test]
    fn test_document_id_deterministic() {
        let a = derive_document_id(Channel::Sms, "msg-123");
        let b = derive_document_id(Channel::Sms, "msg-123");
        assert_eq!(a, b);
        assert!(a.starts_with("doc_"));
        assert_eq!(a.len(), "doc_".len() + 32);

        // Channel participates in the id
        let c = derive_document_id(Channel::Whatsapp, "msg-123");
        assert_ne!(a, c);
    }

    #[test]
    fn test_synthesized_message_id_stable() {
        let ids = vec!["att-1".to_string()];
        let a = synthesize_message_id(Channel::Email, "alice@x.com", "2025-01-01T00:00:00Z", "hi", &ids);
        let b = synthesize_message_id(Channel::Email, "alice@x.com", "2025-01-01T00:00:00Z", "hi", &ids);
        assert_eq!(a, b);
        assert!(a.starts_with("syn_"));

        let c = synthesize_message_id(Channel::Email, "alice@x.com", "2025-01-01T00:00:00Z", "hi!", &ids);
        assert_ne!(a, c);
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("+1 (555) 000-1111"), "15550001111");
        assert_eq!(normalize_phone("tel:+15550001111"), "15550001111");
        assert_eq!(normalize_phone("no digits"), "");
    }

    #[test]
    fn test_contact_identity_key() {
        let mut contact = Contact::with_handle("Bob@X.com");
        assert_eq!(contact.identity_key(), "bob@x.com");

        contact.handle = String::new();
        contact.display_name = "Bob Smith".to_string();
        assert_eq!(contact.identity_key(), "bob smith");
    }

    #[test]
    fn test_contact_serialization() {
        let contact = Contact {
            display_name: "Alice".to_string(),
            channels: ChannelHandles {
                phone: vec!["+15550001111".to_string()],
                email: vec!["alice@x.com".to_string()],
            },
            last_contacted: Some("2025-01-01T00:00:00Z".to_string()),
            last_channel: Some("sms".to_string()),
            ..Contact::with_handle("alice@x.com")
        };

        let json = serde_json::to_string(&contact).unwrap();
        let restored: Contact = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, contact);
    }

    #[test]
    fn test_contact_deserializes_sparse_record() {
        // Records written by older processes may omit most fields
        let json = r#"{"id":"ct_01HZX5W9G9T4D8R2M3N4P5Q6R7","handle":"bob@x.com"}"#;
        let contact: Contact = serde_json::from_str(json).unwrap();
        assert_eq!(contact.handle, "bob@x.com");
        assert_eq!(contact.status, ContactStatus::Open);
        assert!(contact.notes.is_empty());
        assert!(contact.last_contacted.is_none());
    }

    #[test]
    fn test_suggestion_kind_mapping() {
        assert!(SuggestionKind::Emails.is_channel_list());
        assert!(SuggestionKind::Phones.is_channel_list());
        assert!(!SuggestionKind::Links.is_channel_list());
        assert_eq!(SuggestionKind::Links.note_kind(), NoteKind::Link);
        assert_eq!(SuggestionKind::from_str_loose("EMAILS"), Some(SuggestionKind::Emails));
        assert_eq!(SuggestionKind::from_str_loose("carrier"), None);
    }

    #[test]
    fn test_audit_record_serialization() {
        let record = AuditRecord {
            at: "2025-01-01T00:00:00Z".to_string(),
            status: AuditStatus::Duplicate,
            channel: "sms".to_string(),
            message_id: "msg-1".to_string(),
            peer: "+15550001111".to_string(),
            doc: derive_document_id(Channel::Sms, "msg-1"),
            reason: Some("seen_or_existing".to_string()),
            error: None,
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"duplicate\""));
        let restored: AuditRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, record);
    }
}
