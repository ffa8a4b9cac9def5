//! Identifiers for mesh bases, mesh objects and access paths
//!
//! A `MeshBaseId` is the canonical external form of a store (for example
//! `local:alpha` or `file:///srv/feed.json`). A `MeshObjectId` names an object
//! relative to the mesh base it originated in; the empty local name is that
//! mesh base's home object.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Separator between the mesh base part and the local part of an object id
const OBJECT_SEPARATOR: char = '#';

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("Empty mesh base identifier")]
    Empty,
    #[error("Invalid mesh object identifier: {0}")]
    InvalidObject(String),
}

/// Identifies a mesh base (a local store, a remote store or a shadowed data source)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeshBaseId(String);

impl MeshBaseId {
    /// Create an identifier from its external form
    pub fn new(external: impl Into<String>) -> Result<Self, IdentifierError> {
        let external = external.into();
        let trimmed = external.trim();
        if trimmed.is_empty() {
            return Err(IdentifierError::Empty);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// External form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// URL scheme of the external form, if it has one (`file`, `https`, `local`, ...)
    pub fn scheme(&self) -> Option<&str> {
        self.0.split_once(':').map(|(scheme, _)| scheme)
    }

    /// Key-safe form used when this id is part of a storage key
    pub fn storage_key(&self) -> String {
        hex::encode(self.0.as_bytes())
    }
}

impl fmt::Display for MeshBaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for MeshBaseId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identifies a mesh object across the whole mesh
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeshObjectId {
    /// Mesh base the object originated in
    pub mesh_base: MeshBaseId,
    /// Name local to that mesh base; empty for the home object
    pub local: String,
}

impl MeshObjectId {
    pub fn new(mesh_base: MeshBaseId, local: impl Into<String>) -> Self {
        Self {
            mesh_base,
            local: local.into(),
        }
    }

    /// The home object of a mesh base
    pub fn home(mesh_base: &MeshBaseId) -> Self {
        Self::new(mesh_base.clone(), "")
    }

    pub fn is_home_object(&self) -> bool {
        self.local.is_empty()
    }

    /// Parse `<mesh base>#<local>`; a missing `#` denotes the home object
    pub fn parse(external: &str) -> Result<Self, IdentifierError> {
        match external.rsplit_once(OBJECT_SEPARATOR) {
            Some((base, local)) => {
                let mesh_base = MeshBaseId::new(base)
                    .map_err(|_| IdentifierError::InvalidObject(external.to_string()))?;
                Ok(Self::new(mesh_base, local))
            }
            None => {
                let mesh_base = MeshBaseId::new(external)
                    .map_err(|_| IdentifierError::InvalidObject(external.to_string()))?;
                Ok(Self::home(&mesh_base))
            }
        }
    }
}

impl fmt::Display for MeshObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.mesh_base, OBJECT_SEPARATOR, self.local)
    }
}

/// Where a replica can be obtained from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessPath {
    /// The mesh base to ask
    pub mesh_base: MeshBaseId,
    /// The object to obtain; `None` means the mesh base's home object
    pub object: Option<MeshObjectId>,
}

impl AccessPath {
    /// Path to the home object of a mesh base
    pub fn to_home(mesh_base: MeshBaseId) -> Self {
        Self {
            mesh_base,
            object: None,
        }
    }

    pub fn to_object(mesh_base: MeshBaseId, object: MeshObjectId) -> Self {
        Self {
            mesh_base,
            object: Some(object),
        }
    }

    /// The object this path resolves to
    pub fn target(&self) -> MeshObjectId {
        self.object
            .clone()
            .unwrap_or_else(|| MeshObjectId::home(&self.mesh_base))
    }
}

impl fmt::Display for AccessPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.object {
            Some(object) => write!(f, "{} -> {}", self.mesh_base, object),
            None => write!(f, "{}", self.mesh_base),
        }
    }
}
