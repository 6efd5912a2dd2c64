use kiosk_core::{Embedding, HashAlgorithm, KeyError, UserTemplate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Current on-disk layout version.
const STORE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("template store I/O error: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("template store encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported template store version: {0}")]
    UnsupportedVersion(u64),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Persistent mapping from hashed-name key to enrolled template.
///
/// Loaded once at startup and rewritten in full after each enrollment.
/// A missing or unreadable file yields an empty store; it never aborts startup.
#[derive(Debug)]
pub struct TemplateStore {
    path: PathBuf,
    algorithm: HashAlgorithm,
    users: BTreeMap<String, UserTemplate>,
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    hash_algorithm: String,
    users: BTreeMap<String, StoredUser>,
}

#[derive(Serialize, Deserialize)]
struct StoredUser {
    name: String,
    embedding: Embedding,
}

impl TemplateStore {
    /// An empty store that will be written to `path`.
    pub fn empty(path: &Path, algorithm: HashAlgorithm) -> Self {
        Self {
            path: path.to_path_buf(),
            algorithm,
            users: BTreeMap::new(),
        }
    }

    /// Load the store at `path`, falling back to an empty store on any failure.
    ///
    /// A store written with another hash algorithm keeps that algorithm, so
    /// every key in the file is derived the same way.
    pub fn load(path: &Path, algorithm: HashAlgorithm) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no template store yet, starting empty");
                return Self::empty(path, algorithm);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "template store unreadable, starting empty");
                return Self::empty(path, algorithm);
            }
        };

        match decode(&text, algorithm) {
            Ok((stored, users)) => {
                let users = drop_unusable(users);
                tracing::info!(path = %path.display(), users = users.len(), "template store loaded");
                Self {
                    path: path.to_path_buf(),
                    algorithm: stored,
                    users,
                }
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "template store corrupted, starting empty");
                Self::empty(path, algorithm)
            }
        }
    }

    /// Rewrite the whole store: write a sibling temp file, then rename over the original.
    pub fn save(&self) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let file = StoreFile {
            version: STORE_VERSION,
            hash_algorithm: self.algorithm.to_string(),
            users: self
                .users
                .iter()
                .map(|(key, t)| {
                    (
                        key.clone(),
                        StoredUser {
                            name: t.name.clone(),
                            embedding: t.embedding.clone(),
                        },
                    )
                })
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let tmp_path = self.path.with_extension("json.part");
        std::fs::write(&tmp_path, json).map_err(io_err)?;
        std::fs::rename(&tmp_path, &self.path).map_err(io_err)?;

        tracing::debug!(path = %self.path.display(), users = self.users.len(), "template store saved");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Templates in key order.
    pub fn templates(&self) -> impl Iterator<Item = &UserTemplate> {
        self.users.values()
    }

    /// Exact, case-sensitive match on display name.
    pub fn name_exists(&self, name: &str) -> bool {
        self.get_by_name(name).is_some()
    }

    /// Look up by hashed key, falling back to a scan over display names.
    pub fn get_by_name(&self, name: &str) -> Option<&UserTemplate> {
        let key = self.algorithm.hash_name(name);
        self.users
            .get(&key)
            .filter(|t| t.name == name)
            .or_else(|| self.users.values().find(|t| t.name == name))
    }

    pub(crate) fn insert(&mut self, template: UserTemplate) -> Option<UserTemplate> {
        self.users.insert(template.key.clone(), template)
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<UserTemplate> {
        self.users.remove(key)
    }
}

/// Decode a store file, migrating the legacy unversioned layout
/// (a bare object of `name -> [f32]`). Returns the algorithm the keys were
/// derived with.
fn decode(
    text: &str,
    algorithm: HashAlgorithm,
) -> Result<(HashAlgorithm, BTreeMap<String, UserTemplate>), StoreError> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    match value.get("version").and_then(|v| v.as_u64()) {
        Some(v) if v == u64::from(STORE_VERSION) => {
            let file: StoreFile = serde_json::from_value(value)?;
            let stored: HashAlgorithm = file.hash_algorithm.parse().map_err(StoreError::Key)?;
            if stored != algorithm {
                tracing::warn!(
                    %stored,
                    configured = %algorithm,
                    "store keys use a different hash algorithm; keeping the stored one"
                );
            }
            let users = file
                .users
                .into_iter()
                .map(|(key, u)| {
                    let template = UserTemplate {
                        key: key.clone(),
                        name: u.name,
                        embedding: u.embedding,
                    };
                    (key, template)
                })
                .collect();
            Ok((stored, users))
        }
        Some(v) => Err(StoreError::UnsupportedVersion(v)),
        None => {
            let legacy: BTreeMap<String, Vec<f32>> = serde_json::from_value(value)?;
            tracing::info!(users = legacy.len(), "migrating legacy template store");
            let users = legacy
                .into_iter()
                .map(|(name, values)| {
                    let key = algorithm.hash_name(&name);
                    let template = UserTemplate {
                        key: key.clone(),
                        name,
                        embedding: Embedding::new(values),
                    };
                    (key, template)
                })
                .collect();
            Ok((algorithm, users))
        }
    }
}

/// Drop templates that cannot be matched: non-finite or empty vectors, and
/// vectors whose dimension differs from the most common one in the store.
fn drop_unusable(mut users: BTreeMap<String, UserTemplate>) -> BTreeMap<String, UserTemplate> {
    users.retain(|key, t| {
        let valid = t.embedding.is_valid();
        if !valid {
            tracing::warn!(key = %key, name = %t.name, "dropping template with invalid embedding values");
        }
        valid
    });

    let mut counts: HashMap<usize, usize> = HashMap::new();
    for t in users.values() {
        *counts.entry(t.embedding.dim()).or_default() += 1;
    }
    let Some(expected) = counts
        .into_iter()
        .max_by_key(|&(dim, count)| (count, dim))
        .map(|(dim, _)| dim)
    else {
        return users;
    };

    users.retain(|key, t| {
        let dim = t.embedding.dim();
        if dim != expected {
            tracing::warn!(key = %key, name = %t.name, dim, expected, "dropping template with inconsistent embedding dimension");
        }
        dim == expected
    });
    users
}
