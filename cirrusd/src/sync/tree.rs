use std::collections::HashMap;

use cirrus_core::{EntryKind, RemoteEntry};

/// Placeholder id inserted while an upload is in flight; replaced by the
/// real entry on completion and removed on failure.
pub const PLACEHOLDER_ID: i64 = -1;

/// Where an entry's parent folder resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentRef {
    /// The workspace top level (absent parent_id).
    Root,
    Folder(i64),
    /// The directory part is non-empty but unknown. Callers defer; falling
    /// back to root would silently misplace the file.
    Unresolved,
}

/// Transient snapshot of the remote tree for one reconcile pass, keyed by
/// normalized relative path. Keys compare case-insensitively; the
/// original-case path is preserved alongside each entry.
#[derive(Default)]
pub struct RemoteTreeMap {
    slots: HashMap<String, TreeSlot>,
}

#[derive(Debug, Clone)]
pub struct TreeSlot {
    pub path: String,
    pub entry: RemoteEntry,
}

/// Lowercased, forward-slash, no leading or trailing separators.
pub fn normalize_key(rel_path: &str) -> String {
    rel_path
        .replace('\\', "/")
        .trim_matches('/')
        .to_lowercase()
}

/// The directory part of a normalized relative path, or None at top level.
pub fn dirname(rel_path: &str) -> Option<&str> {
    let trimmed = rel_path.trim_matches('/');
    trimmed.rsplit_once('/').map(|(dir, _)| dir)
}

/// The final component of a relative path.
pub fn basename(rel_path: &str) -> &str {
    let trimmed = rel_path.trim_matches('/');
    trimmed.rsplit_once('/').map_or(trimmed, |(_, name)| name)
}

impl RemoteTreeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rel_path: &str, entry: RemoteEntry) {
        self.slots.insert(
            normalize_key(rel_path),
            TreeSlot {
                path: rel_path.trim_matches('/').to_string(),
                entry,
            },
        );
    }

    pub fn get(&self, rel_path: &str) -> Option<&RemoteEntry> {
        self.slots.get(&normalize_key(rel_path)).map(|slot| &slot.entry)
    }

    pub fn get_slot(&self, rel_path: &str) -> Option<&TreeSlot> {
        self.slots.get(&normalize_key(rel_path))
    }

    pub fn contains(&self, rel_path: &str) -> bool {
        self.slots.contains_key(&normalize_key(rel_path))
    }

    pub fn remove(&mut self, rel_path: &str) -> Option<RemoteEntry> {
        self.slots.remove(&normalize_key(rel_path)).map(|slot| slot.entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TreeSlot> {
        self.slots.values()
    }

    pub fn files(&self) -> impl Iterator<Item = &TreeSlot> {
        self.slots
            .values()
            .filter(|slot| slot.entry.kind == EntryKind::File)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Resolves the parent folder id for a relative path. Pure lookup of the
    /// path's directory part among folder entries; placeholders do not
    /// resolve.
    pub fn resolve_parent(&self, rel_path: &str) -> ParentRef {
        let Some(dir) = dirname(rel_path) else {
            return ParentRef::Root;
        };
        if dir.is_empty() {
            return ParentRef::Root;
        }
        match self.slots.get(&normalize_key(dir)) {
            Some(slot)
                if slot.entry.kind == EntryKind::Folder
                    && slot.entry.id != PLACEHOLDER_ID =>
            {
                ParentRef::Folder(slot.entry.id)
            }
            _ => ParentRef::Unresolved,
        }
    }
}
