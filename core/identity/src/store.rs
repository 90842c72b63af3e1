use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use contact_hub_schemas::{
    generate_note_id, generate_suggestion_id, normalize_phone, Contact, ChannelHandles, Note,
    NoteKind, Suggestion, SuggestionKind,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

/// Minimum digit count before the substring phone match is attempted.
/// Shorter fragments (extensions, short codes) produce false positives.
const PHONE_MATCH_MIN_DIGITS: usize = 7;

/// Shallow patch applied by [`ContactStore::update_contact`]. Fields left as
/// `None` keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactPatch {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub status: Option<contact_hub_schemas::ContactStatus>,
    #[serde(default)]
    pub draft: Option<String>,
    #[serde(default)]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub channels: Option<ChannelHandles>,
    #[serde(default)]
    pub last_channel: Option<String>,
}

/// Flat-file contact collection.
///
/// Persistence is a full-file read-modify-write: `save` replaces the entire
/// collection. The mtime check in `reload_if_changed` is the only
/// cross-process coherence mechanism — cheap, best-effort, not a lock —
/// so every read-path operation reloads before touching records.
pub struct ContactStore {
    path: PathBuf,
    contacts: Vec<Contact>,
    loaded_mtime: Option<SystemTime>,
}

impl ContactStore {
    /// Open the store backed by the given file, loading it if it exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut store = Self {
            path: path.as_ref().to_path_buf(),
            contacts: Vec::new(),
            loaded_mtime: None,
        };
        store.load()?;
        Ok(store)
    }

    /// Read the backing file, deduplicate colliding records and, when the
    /// dedup shrank the collection, proactively rewrite the file.
    pub fn load(&mut self) -> Result<()> {
        if !self.path.exists() {
            self.contacts = Vec::new();
            self.loaded_mtime = None;
            return Ok(());
        }

        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading contact store {}", self.path.display()))?;
        let records: Vec<Contact> = if raw.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing contact store {}", self.path.display()))?
        };

        let before = records.len();
        self.contacts = dedupe_contacts(records);
        self.loaded_mtime = file_mtime(&self.path);

        if self.contacts.len() < before {
            info!(
                "Contact dedup collapsed {} records into {}",
                before,
                self.contacts.len()
            );
            self.save()?;
        }

        Ok(())
    }

    /// Reload when the backing file changed on disk since the last read.
    fn reload_if_changed(&mut self) -> Result<()> {
        let current = file_mtime(&self.path);
        if current != self.loaded_mtime {
            debug!("Contact store changed on disk, reloading");
            self.load()?;
        }
        Ok(())
    }

    /// Atomically rewrite the whole collection (write-temp-then-rename).
    pub fn save(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let json = serde_json::to_string_pretty(&self.contacts)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("creating temp file in {}", dir.display()))?;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(&self.path)
            .with_context(|| format!("replacing contact store {}", self.path.display()))?;

        self.loaded_mtime = file_mtime(&self.path);
        Ok(())
    }

    /// Number of contacts currently loaded.
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// All contacts, reloading first for cross-process coherence.
    pub fn all_contacts(&mut self) -> Result<Vec<Contact>> {
        self.reload_if_changed()?;
        Ok(self.contacts.clone())
    }

    /// Exact case-insensitive lookup, tried in order: handle, display name,
    /// alias list, channel emails, channel phones (exact), channel phones
    /// (digit-normalized substring).
    pub fn find_contact(&mut self, identifier: &str) -> Result<Option<Contact>> {
        self.reload_if_changed()?;
        Ok(self.find_index(identifier).map(|i| self.contacts[i].clone()))
    }

    fn find_index(&self, identifier: &str) -> Option<usize> {
        let query = identifier.trim().to_lowercase();
        if query.is_empty() {
            return None;
        }

        if let Some(i) = self
            .contacts
            .iter()
            .position(|c| c.handle.trim().to_lowercase() == query)
        {
            return Some(i);
        }
        if let Some(i) = self
            .contacts
            .iter()
            .position(|c| c.display_name.trim().to_lowercase() == query)
        {
            return Some(i);
        }
        if let Some(i) = self.contacts.iter().position(|c| {
            c.aliases
                .iter()
                .any(|a| a.trim().to_lowercase() == query)
        }) {
            return Some(i);
        }
        if let Some(i) = self.contacts.iter().position(|c| {
            c.channels
                .email
                .iter()
                .any(|e| e.trim().to_lowercase() == query)
        }) {
            return Some(i);
        }
        if let Some(i) = self.contacts.iter().position(|c| {
            c.channels
                .phone
                .iter()
                .any(|p| p.trim().to_lowercase() == query)
        }) {
            return Some(i);
        }

        // Digit-normalized substring match, last resort
        let digits = normalize_phone(&query);
        if digits.len() >= PHONE_MATCH_MIN_DIGITS {
            if let Some(i) = self.contacts.iter().position(|c| {
                c.channels.phone.iter().any(|p| {
                    let pd = normalize_phone(p);
                    pd.len() >= PHONE_MATCH_MIN_DIGITS
                        && (pd.contains(&digits) || digits.contains(&pd))
                })
            }) {
                return Some(i);
            }
        }

        None
    }

    fn find_or_create(&mut self, identifier: &str) -> usize {
        if let Some(i) = self.find_index(identifier) {
            return i;
        }

        let handle = identifier.trim();
        let mut contact = Contact::with_handle(handle);
        // Seed the matching channel list so future lookups resolve
        if handle.contains('@') {
            contact.channels.email.push(handle.to_lowercase());
        } else if normalize_phone(handle).len() >= PHONE_MATCH_MIN_DIGITS {
            contact.channels.phone.push(handle.to_string());
        }
        info!("Creating contact for unknown identifier '{}'", handle);
        self.contacts.push(contact);
        self.contacts.len() - 1
    }

    /// Find or auto-create a contact, advance `last_contacted` when the new
    /// timestamp is strictly newer, and record the channel when provided.
    pub fn update_last_contacted(
        &mut self,
        identifier: &str,
        timestamp: &str,
        channel: Option<&str>,
    ) -> Result<Contact> {
        self.reload_if_changed()?;
        let i = self.find_or_create(identifier);

        let newer = match &self.contacts[i].last_contacted {
            None => true,
            Some(existing) => is_strictly_newer(timestamp, existing),
        };
        if newer {
            self.contacts[i].last_contacted = Some(timestamp.to_string());
        }
        if let Some(ch) = channel {
            self.contacts[i].last_channel = Some(ch.to_string());
        }

        self.save()?;
        Ok(self.contacts[i].clone())
    }

    /// Shallow-merge patch fields onto the contact, creating it if absent.
    pub fn update_contact(&mut self, handle: &str, patch: ContactPatch) -> Result<Contact> {
        self.reload_if_changed()?;
        let i = self.find_or_create(handle);
        let contact = &mut self.contacts[i];

        if let Some(name) = patch.display_name {
            contact.display_name = name;
        }
        if let Some(status) = patch.status {
            contact.status = status;
        }
        if let Some(draft) = patch.draft {
            contact.draft = Some(draft);
        }
        if let Some(aliases) = patch.aliases {
            contact.aliases = aliases;
        }
        if let Some(channels) = patch.channels {
            contact.channels = channels;
        }
        if let Some(last_channel) = patch.last_channel {
            contact.last_channel = Some(last_channel);
        }

        self.save()?;
        Ok(self.contacts[i].clone())
    }

    /// Append a pending suggestion unless its content was already rejected,
    /// is already present on the contact, or is already pending. Returns the
    /// new suggestion, or `None` when the call was a no-op.
    pub fn add_suggestion(
        &mut self,
        handle: &str,
        kind: SuggestionKind,
        content: &str,
    ) -> Result<Option<Suggestion>> {
        self.reload_if_changed()?;
        let i = self.find_or_create(handle);
        let contact = &mut self.contacts[i];
        let needle = content.trim().to_lowercase();

        if contact
            .rejected_suggestions
            .iter()
            .any(|r| r.trim().to_lowercase() == needle)
        {
            debug!("Suggestion '{}' previously rejected, skipping", content);
            return Ok(None);
        }
        if contact.notes.iter().any(|n| {
            n.value.trim().to_lowercase() == needle || n.text.to_lowercase().contains(&needle)
        }) {
            return Ok(None);
        }
        if channel_list_contains(contact, kind, content) {
            return Ok(None);
        }
        if contact
            .pending_suggestions
            .iter()
            .any(|s| s.content.trim().to_lowercase() == needle)
        {
            return Ok(None);
        }

        let suggestion = Suggestion {
            id: generate_suggestion_id(),
            kind,
            content: content.trim().to_string(),
            timestamp: Utc::now().to_rfc3339(),
        };
        contact.pending_suggestions.push(suggestion.clone());
        self.save()?;
        Ok(Some(suggestion))
    }

    /// Remove the suggestion from pending and fold its content into the
    /// matching channel list or the structured note log.
    pub fn accept_suggestion(&mut self, handle: &str, suggestion_id: &str) -> Result<bool> {
        self.reload_if_changed()?;
        let Some(i) = self.find_index(handle) else {
            return Ok(false);
        };
        let contact = &mut self.contacts[i];

        let Some(pos) = contact
            .pending_suggestions
            .iter()
            .position(|s| s.id.0 == suggestion_id)
        else {
            return Ok(false);
        };
        let suggestion = contact.pending_suggestions.remove(pos);

        match suggestion.kind {
            SuggestionKind::Emails => {
                let email = suggestion.content.trim().to_lowercase();
                if !contact
                    .channels
                    .email
                    .iter()
                    .any(|e| e.trim().to_lowercase() == email)
                {
                    contact.channels.email.push(email);
                }
            }
            SuggestionKind::Phones => {
                let digits = normalize_phone(&suggestion.content);
                if !contact
                    .channels
                    .phone
                    .iter()
                    .any(|p| normalize_phone(p) == digits)
                {
                    contact.channels.phone.push(suggestion.content.trim().to_string());
                }
            }
            other => {
                push_note_deduped(
                    &mut contact.notes,
                    other.note_kind(),
                    &suggestion.content,
                    "suggestion",
                );
            }
        }

        self.save()?;
        Ok(true)
    }

    /// Remove the suggestion from pending and remember its content so it is
    /// never re-suggested.
    pub fn decline_suggestion(&mut self, handle: &str, suggestion_id: &str) -> Result<bool> {
        self.reload_if_changed()?;
        let Some(i) = self.find_index(handle) else {
            return Ok(false);
        };
        let contact = &mut self.contacts[i];

        let Some(pos) = contact
            .pending_suggestions
            .iter()
            .position(|s| s.id.0 == suggestion_id)
        else {
            return Ok(false);
        };
        let suggestion = contact.pending_suggestions.remove(pos);

        let needle = suggestion.content.trim().to_lowercase();
        if !contact
            .rejected_suggestions
            .iter()
            .any(|r| r.trim().to_lowercase() == needle)
        {
            contact.rejected_suggestions.push(suggestion.content);
        }

        self.save()?;
        Ok(true)
    }

    /// Append a free-form note to a contact's structured note log.
    pub fn add_note(
        &mut self,
        handle: &str,
        kind: NoteKind,
        content: &str,
        source: &str,
    ) -> Result<Contact> {
        self.reload_if_changed()?;
        let i = self.find_or_create(handle);
        push_note_deduped(&mut self.contacts[i].notes, kind, content, source);
        self.save()?;
        Ok(self.contacts[i].clone())
    }

    /// Absorb `source` into `target` and discard the source record. Contacts
    /// are never hard-deleted; merging is the only way a record disappears.
    pub fn merge_contacts(&mut self, source: &str, target: &str) -> Result<Option<Contact>> {
        self.reload_if_changed()?;
        let Some(src_idx) = self.find_index(source) else {
            return Ok(None);
        };
        let Some(tgt_idx) = self.find_index(target) else {
            return Ok(None);
        };
        if src_idx == tgt_idx {
            return Ok(Some(self.contacts[tgt_idx].clone()));
        }

        let absorbed = self.contacts.remove(src_idx);
        let tgt_idx = if src_idx < tgt_idx { tgt_idx - 1 } else { tgt_idx };
        let target_contact = &mut self.contacts[tgt_idx];

        // Keep the absorbed handle reachable as an alias
        if !absorbed.handle.trim().is_empty() {
            let alias = absorbed.handle.clone();
            let lower = alias.trim().to_lowercase();
            if target_contact.handle.trim().to_lowercase() != lower
                && !target_contact
                    .aliases
                    .iter()
                    .any(|a| a.trim().to_lowercase() == lower)
            {
                target_contact.aliases.push(alias);
            }
        }
        merge_record(target_contact, absorbed);

        info!("Merged contact '{}' into '{}'", source, target);
        self.save()?;
        Ok(Some(self.contacts[tgt_idx].clone()))
    }
}

/// Deduplicate records keyed by lowercase handle-or-display-name. When two
/// records collide the one with the smaller id (ULIDs are creation-ordered,
/// so the earliest-created record) survives as the base and the other is
/// unioned into it — deterministic regardless of file order.
fn dedupe_contacts(records: Vec<Contact>) -> Vec<Contact> {
    let mut by_key: HashMap<String, Contact> = HashMap::new();
    let mut keyless: Vec<Contact> = Vec::new();
    let mut order: Vec<String> = Vec::new();

    for record in records {
        let key = record.identity_key();
        if key.is_empty() {
            keyless.push(record);
            continue;
        }
        match by_key.remove(&key) {
            None => {
                order.push(key.clone());
                by_key.insert(key, record);
            }
            Some(existing) => {
                let (mut base, other) = if existing.id <= record.id {
                    (existing, record)
                } else {
                    (record, existing)
                };
                merge_record(&mut base, other);
                by_key.insert(key, base);
            }
        }
    }

    let mut out: Vec<Contact> = order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect();
    out.extend(keyless);
    out
}

/// Union `other` into `base`: non-empty scalars win (base preferred), array
/// fields are unioned with per-entry dedup, the most recent `last_contacted`
/// is kept.
fn merge_record(base: &mut Contact, other: Contact) {
    if base.display_name.trim().is_empty() {
        base.display_name = other.display_name;
    }
    if base.handle.trim().is_empty() {
        base.handle = other.handle;
    }
    if base.draft.is_none() {
        base.draft = other.draft;
    }

    for alias in other.aliases {
        let lower = alias.trim().to_lowercase();
        if !base.aliases.iter().any(|a| a.trim().to_lowercase() == lower) {
            base.aliases.push(alias);
        }
    }
    for phone in other.channels.phone {
        let digits = normalize_phone(&phone);
        if !base
            .channels
            .phone
            .iter()
            .any(|p| normalize_phone(p) == digits)
        {
            base.channels.phone.push(phone);
        }
    }
    for email in other.channels.email {
        let lower = email.trim().to_lowercase();
        if !base
            .channels
            .email
            .iter()
            .any(|e| e.trim().to_lowercase() == lower)
        {
            base.channels.email.push(email);
        }
    }
    for note in other.notes {
        let exists = base.notes.iter().any(|n| {
            n.kind == note.kind && n.value.trim().to_lowercase() == note.value.trim().to_lowercase()
        });
        if !exists {
            base.notes.push(note);
        }
    }
    for suggestion in other.pending_suggestions {
        let needle = suggestion.content.trim().to_lowercase();
        let rejected = base
            .rejected_suggestions
            .iter()
            .any(|r| r.trim().to_lowercase() == needle);
        let pending = base
            .pending_suggestions
            .iter()
            .any(|s| s.content.trim().to_lowercase() == needle);
        if !rejected && !pending {
            base.pending_suggestions.push(suggestion);
        }
    }
    for rejected in other.rejected_suggestions {
        let needle = rejected.trim().to_lowercase();
        if !base
            .rejected_suggestions
            .iter()
            .any(|r| r.trim().to_lowercase() == needle)
        {
            base.rejected_suggestions.push(rejected);
        }
        // A rejection always wins over a pending copy of the same content
        base.pending_suggestions
            .retain(|s| s.content.trim().to_lowercase() != needle);
    }

    let other_newer = match (&base.last_contacted, &other.last_contacted) {
        (None, Some(_)) => true,
        (Some(b), Some(o)) => is_strictly_newer(o, b),
        _ => false,
    };
    if other_newer {
        base.last_contacted = other.last_contacted;
        if other.last_channel.is_some() {
            base.last_channel = other.last_channel;
        }
    } else if base.last_channel.is_none() {
        base.last_channel = other.last_channel;
    }
}

fn channel_list_contains(contact: &Contact, kind: SuggestionKind, content: &str) -> bool {
    match kind {
        SuggestionKind::Emails => {
            let needle = content.trim().to_lowercase();
            contact
                .channels
                .email
                .iter()
                .any(|e| e.trim().to_lowercase() == needle)
        }
        SuggestionKind::Phones => {
            let digits = normalize_phone(content);
            !digits.is_empty()
                && contact
                    .channels
                    .phone
                    .iter()
                    .any(|p| normalize_phone(p) == digits)
        }
        _ => false,
    }
}

fn push_note_deduped(notes: &mut Vec<Note>, kind: NoteKind, content: &str, source: &str) {
    let needle = content.trim().to_lowercase();
    let exists = notes
        .iter()
        .any(|n| n.kind == kind && n.value.trim().to_lowercase() == needle);
    if exists {
        return;
    }
    notes.push(Note {
        id: generate_note_id(),
        kind,
        value: content.trim().to_string(),
        text: content.trim().to_string(),
        timestamp: Utc::now().to_rfc3339(),
        source: source.to_string(),
    });
}

/// `candidate` is strictly newer than `existing`. Unparseable candidates are
/// never newer; an unparseable existing value is always superseded.
fn is_strictly_newer(candidate: &str, existing: &str) -> bool {
    let Ok(candidate) = DateTime::parse_from_rfc3339(candidate) else {
        return false;
    };
    match DateTime::parse_from_rfc3339(existing) {
        Ok(existing) => candidate > existing,
        Err(_) => true,
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use contact_hub_schemas::{generate_contact_id, ContactStatus};
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> ContactStore {
        ContactStore::open(dir.path().join("contacts.json")).unwrap()
    }

    #[test]
    fn test_auto_creates_contact_on_update_last_contacted() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        let contact = store
            .update_last_contacted("+15550001111", "2025-01-01T00:00:00Z", Some("sms"))
            .unwrap();

        assert_eq!(contact.handle, "+15550001111");
        assert!(contact.channels.phone.contains(&"+15550001111".to_string()));
        assert_eq!(contact.last_channel.as_deref(), Some("sms"));
        assert_eq!(contact.last_contacted.as_deref(), Some("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn test_last_contacted_only_moves_forward() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        store
            .update_last_contacted("alice@x.com", "2025-06-01T12:00:00Z", Some("email"))
            .unwrap();
        let contact = store
            .update_last_contacted("alice@x.com", "2025-01-01T00:00:00Z", Some("sms"))
            .unwrap();

        // Older timestamp does not regress, channel is still recorded
        assert_eq!(contact.last_contacted.as_deref(), Some("2025-06-01T12:00:00Z"));
        assert_eq!(contact.last_channel.as_deref(), Some("sms"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_find_contact_lookup_ladder() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        store
            .update_contact(
                "alice@x.com",
                ContactPatch {
                    display_name: Some("Alice Liddell".to_string()),
                    aliases: Some(vec!["wonderalice".to_string()]),
                    channels: Some(ChannelHandles {
                        phone: vec!["+1 (555) 000-2222".to_string()],
                        email: vec!["alice@x.com".to_string(), "a.liddell@work.com".to_string()],
                    }),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(store.find_contact("ALICE@X.COM").unwrap().is_some());
        assert!(store.find_contact("alice liddell").unwrap().is_some());
        assert!(store.find_contact("WonderAlice").unwrap().is_some());
        assert!(store.find_contact("A.Liddell@Work.com").unwrap().is_some());
        assert!(store.find_contact("+1 (555) 000-2222").unwrap().is_some());
        // Digit-normalized substring: same number, different formatting
        assert!(store.find_contact("15550002222").unwrap().is_some());
        assert!(store.find_contact("nobody@else.com").unwrap().is_none());
    }

    #[test]
    fn test_suggestion_lifecycle_decline_blocks_resuggest() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        let suggestion = store
            .add_suggestion("alice@x.com", SuggestionKind::Emails, "alice2@x.com")
            .unwrap()
            .expect("first suggestion should be pending");

        assert!(store
            .decline_suggestion("alice@x.com", &suggestion.id.0)
            .unwrap());

        // Re-suggesting declined content is a no-op
        let again = store
            .add_suggestion("alice@x.com", SuggestionKind::Emails, "alice2@x.com")
            .unwrap();
        assert!(again.is_none());

        let contact = store.find_contact("alice@x.com").unwrap().unwrap();
        assert!(contact.pending_suggestions.is_empty());
        assert_eq!(contact.rejected_suggestions, vec!["alice2@x.com".to_string()]);
    }

    #[test]
    fn test_accept_suggestion_folds_into_channels() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        let email = store
            .add_suggestion("bob@x.com", SuggestionKind::Emails, "Bob.Alt@X.com")
            .unwrap()
            .unwrap();
        let link = store
            .add_suggestion("bob@x.com", SuggestionKind::Links, "https://bob.example")
            .unwrap()
            .unwrap();

        assert!(store.accept_suggestion("bob@x.com", &email.id.0).unwrap());
        assert!(store.accept_suggestion("bob@x.com", &link.id.0).unwrap());

        let contact = store.find_contact("bob@x.com").unwrap().unwrap();
        assert!(contact.pending_suggestions.is_empty());
        assert!(contact.channels.email.contains(&"bob.alt@x.com".to_string()));
        assert!(contact
            .notes
            .iter()
            .any(|n| n.kind == NoteKind::Link && n.value == "https://bob.example"));
    }

    #[test]
    fn test_add_suggestion_skips_known_content() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        store
            .update_contact(
                "carol@x.com",
                ContactPatch {
                    channels: Some(ChannelHandles {
                        phone: vec!["+15550003333".to_string()],
                        email: vec!["carol@x.com".to_string()],
                    }),
                    ..Default::default()
                },
            )
            .unwrap();

        // Already in the phone list under different formatting
        let phones = store
            .add_suggestion("carol@x.com", SuggestionKind::Phones, "1-555-000-3333")
            .unwrap();
        assert!(phones.is_none());

        // Pending dedup
        store
            .add_suggestion("carol@x.com", SuggestionKind::Notes, "met at rustconf")
            .unwrap()
            .unwrap();
        let dup = store
            .add_suggestion("carol@x.com", SuggestionKind::Notes, "Met at RustConf")
            .unwrap();
        assert!(dup.is_none());
    }

    #[test]
    fn test_load_merges_case_colliding_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contacts.json");

        let mut first = Contact::with_handle("Bob@X.com");
        first.notes.push(Note {
            id: generate_note_id(),
            kind: NoteKind::Note,
            value: "likes jazz".to_string(),
            text: "likes jazz".to_string(),
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            source: "manual".to_string(),
        });
        // Ensure distinct ULID timestamps so creation order is unambiguous
        std::thread::sleep(std::time::Duration::from_millis(2));
        let mut second = Contact::with_handle("bob@x.com");
        second.display_name = "Bob".to_string();
        second.notes.push(Note {
            id: generate_note_id(),
            kind: NoteKind::Note,
            value: "works at acme".to_string(),
            text: "works at acme".to_string(),
            timestamp: "2025-02-01T00:00:00Z".to_string(),
            source: "manual".to_string(),
        });

        std::fs::write(
            &path,
            serde_json::to_string_pretty(&vec![first.clone(), second]).unwrap(),
        )
        .unwrap();

        let mut store = ContactStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);

        let merged = store.find_contact("bob@x.com").unwrap().unwrap();
        // Earliest-created record is the surviving base
        assert_eq!(merged.id, first.id);
        assert_eq!(merged.display_name, "Bob");
        assert_eq!(merged.notes.len(), 2);

        // The shrunk collection was rewritten to disk
        let reloaded: Vec<Contact> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn test_reload_when_file_changes_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contacts.json");
        let mut store = ContactStore::open(&path).unwrap();

        store
            .update_last_contacted("dave@x.com", "2025-01-01T00:00:00Z", None)
            .unwrap();

        // Another process rewrites the file
        let mut outside = Contact::with_handle("eve@x.com");
        outside.display_name = "Eve".to_string();
        std::fs::write(&path, serde_json::to_string_pretty(&vec![outside]).unwrap()).unwrap();
        // Coarse mtime granularity on some filesystems; force a distinct stamp
        let stamp = std::time::SystemTime::now() + std::time::Duration::from_secs(2);
        let file = std::fs::File::options().append(true).open(&path).unwrap();
        file.set_modified(stamp).unwrap();

        assert!(store.find_contact("eve@x.com").unwrap().is_some());
        assert!(store.find_contact("dave@x.com").unwrap().is_none());
    }

    #[test]
    fn test_update_contact_patch_is_shallow() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        store
            .update_contact(
                "frank@x.com",
                ContactPatch {
                    display_name: Some("Frank".to_string()),
                    draft: Some("re: invoice".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let contact = store
            .update_contact(
                "frank@x.com",
                ContactPatch {
                    status: Some(ContactStatus::Closed),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(contact.display_name, "Frank");
        assert_eq!(contact.draft.as_deref(), Some("re: invoice"));
        assert_eq!(contact.status, ContactStatus::Closed);
    }

    #[test]
    fn test_merge_contacts_absorbs_source() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        store
            .update_contact(
                "+15550004444",
                ContactPatch {
                    display_name: Some("G. Hopper".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .update_last_contacted("grace@x.com", "2025-03-01T00:00:00Z", Some("email"))
            .unwrap();

        let merged = store
            .merge_contacts("+15550004444", "grace@x.com")
            .unwrap()
            .unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(merged.handle, "grace@x.com");
        assert_eq!(merged.display_name, "G. Hopper");
        assert!(merged.aliases.contains(&"+15550004444".to_string()));
        assert!(merged.channels.phone.contains(&"+15550004444".to_string()));
        assert!(store.find_contact("+15550004444").unwrap().is_some());
    }

    #[test]
    fn test_dedupe_is_deterministic_regardless_of_order() {
        let mut older = Contact::with_handle("Kim@X.com");
        older.display_name = "Kim".to_string();
        // Force ordering: generate the second id after the first
        std::thread::sleep(std::time::Duration::from_millis(2));
        let mut newer = Contact::with_handle("kim@x.com");
        newer.id = generate_contact_id();
        newer.draft = Some("hello".to_string());

        let forward = dedupe_contacts(vec![older.clone(), newer.clone()]);
        let backward = dedupe_contacts(vec![newer, older.clone()]);

        assert_eq!(forward.len(), 1);
        assert_eq!(forward[0].id, older.id);
        assert_eq!(forward[0].id, backward[0].id);
        assert_eq!(forward[0].draft.as_deref(), Some("hello"));
    }
}
