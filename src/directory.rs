//! Alias directory: the static alias → owner map and its reverse index.
//!
//! Loaded once at startup from a JSON object (`{"support": "owner@real.tld"}`)
//! and never mutated afterwards, so it is shared behind an `Arc` without any
//! locking. Aliases and owner addresses are compared case-insensitively.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use tracing::info;

use crate::address::{WRAP_MARKER, is_valid_email};
use crate::error::DirectoryError;

/// Immutable alias directory.
#[derive(Debug, Clone)]
pub struct AliasDirectory {
    by_alias: HashMap<String, String>,
    by_owner: HashMap<String, BTreeSet<String>>,
}

impl AliasDirectory {
    /// Read and validate the alias file at `path`.
    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        if !path.exists() {
            return Err(DirectoryError::Missing(path.to_path_buf()));
        }

        let raw = std::fs::read_to_string(path).map_err(|source| DirectoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let directory = Self::from_json(&raw)?;
        info!(aliases = directory.len(), path = %path.display(), "Loaded alias directory");
        Ok(directory)
    }

    /// Parse a JSON object of alias to owner address.
    pub fn from_json(raw: &str) -> Result<Self, DirectoryError> {
        let RawEntries(entries) = serde_json::from_str(raw)?;
        Self::from_entries(entries)
    }

    /// Build the directory and its reverse index from `(alias, owner)` pairs.
    pub fn from_entries<I, A, O>(entries: I) -> Result<Self, DirectoryError>
    where
        I: IntoIterator<Item = (A, O)>,
        A: AsRef<str>,
        O: AsRef<str>,
    {
        let mut by_alias = HashMap::new();
        let mut by_owner: HashMap<String, BTreeSet<String>> = HashMap::new();

        for (alias, owner) in entries {
            let alias = alias.as_ref().trim().to_ascii_lowercase();
            let owner = owner.as_ref().trim().to_ascii_lowercase();

            validate_alias(&alias)?;
            if !is_valid_email(&owner) {
                return Err(DirectoryError::InvalidOwner { alias });
            }

            if by_alias.insert(alias.clone(), owner.clone()).is_some() {
                return Err(DirectoryError::DuplicateAlias(alias));
            }
            by_owner.entry(owner).or_default().insert(alias);
        }

        if by_alias.is_empty() {
            return Err(DirectoryError::Empty);
        }

        Ok(Self { by_alias, by_owner })
    }

    /// Owner address of `alias`, if it exists.
    pub fn lookup(&self, alias: &str) -> Option<&str> {
        self.by_alias
            .get(&alias.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Whether `alias` is a known alias.
    pub fn contains_alias(&self, alias: &str) -> bool {
        self.lookup(alias).is_some()
    }

    /// All aliases held by `owner`. Empty if `owner` is not a directory member.
    pub fn aliases_of(&self, owner: &str) -> impl Iterator<Item = &str> {
        self.by_owner
            .get(&owner.trim().to_ascii_lowercase())
            .into_iter()
            .flat_map(|aliases| aliases.iter().map(String::as_str))
    }

    /// Whether `owner` holds at least one alias.
    pub fn is_owner(&self, owner: &str) -> bool {
        self.by_owner
            .contains_key(&owner.trim().to_ascii_lowercase())
    }

    /// Whether `owner` holds `alias`.
    pub fn owns_alias(&self, owner: &str, alias: &str) -> bool {
        self.by_owner
            .get(&owner.trim().to_ascii_lowercase())
            .is_some_and(|aliases| aliases.contains(&alias.to_ascii_lowercase()))
    }

    /// Number of aliases.
    pub fn len(&self) -> usize {
        self.by_alias.len()
    }

    /// Whether the directory holds no aliases. Never true after a successful load.
    pub fn is_empty(&self) -> bool {
        self.by_alias.is_empty()
    }
}

/// File entries in order, repeated keys included, so duplicates reach
/// [`AliasDirectory::from_entries`] instead of overwriting each other.
struct RawEntries(Vec<(String, String)>);

impl<'de> Deserialize<'de> for RawEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = RawEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object of alias to owner address")
            }

            fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> Result<RawEntries, M::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, String>()? {
                    entries.push(entry);
                }
                Ok(RawEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

fn validate_alias(alias: &str) -> Result<(), DirectoryError> {
    let invalid = |reason: &str| DirectoryError::InvalidAlias {
        alias: alias.to_string(),
        reason: reason.to_string(),
    };

    if alias.is_empty() {
        return Err(invalid("empty"));
    }
    if alias.contains('@') {
        return Err(invalid("must be a local part without '@'"));
    }
    if alias.chars().any(char::is_whitespace) {
        return Err(invalid("contains whitespace"));
    }
    // Forward addresses append `_alias`, so the marker must not appear there either.
    if format!("_{alias}").contains(WRAP_MARKER) {
        return Err(invalid("contains the wrap marker"));
    }
    // The alias must itself be usable as a local part.
    if !is_valid_email(&format!("{alias}@example.com")) {
        return Err(invalid("not a valid local part"));
    }
    Ok(())
}
