//! Disguise catalog
//!
//! A disguise is a template of request path and headers that makes the
//! tunnel registration look like traffic from a well-known application
//! (a video-conferencing client, a document-sync client, a banking portal).
//!
//! The catalog is pure data. Request construction lives in
//! [`crate::tunnel`], selection order in [`crate::ledger`].

mod builtin;
mod template;

pub use builtin::BUILTIN_PROFILES;
pub use template::{render, request_id, RequestContext};

use crate::transport::BrowserProfile;
use std::fmt;
use thiserror::Error;

/// Disguise catalog errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DisguiseError {
    #[error("Unknown disguise: {0}")]
    NotFound(String),

    #[error("Disguise catalog is empty")]
    EmptyCatalog,
}

/// A build-time disguise profile
#[derive(Debug, Clone, Copy)]
pub struct DisguiseProfile {
    /// Stable identifier, also sent as the `protocol` query parameter
    pub id: &'static str,
    /// Human readable name
    pub display_name: &'static str,
    /// Static priority (higher is tried first)
    pub priority: u8,
    /// Request path of the registration request
    pub request_path: &'static str,
    /// TLS client fingerprint matching the disguised application
    pub tls_profile: BrowserProfile,
    /// Ordered header templates (name, value template)
    pub headers: &'static [(&'static str, &'static str)],
}

impl DisguiseProfile {
    /// Render the header block for one request
    pub fn render_headers(&self, ctx: &RequestContext) -> Vec<(&'static str, String)> {
        self.headers
            .iter()
            .map(|(name, value)| (*name, render(value, ctx)))
            .collect()
    }
}

impl PartialEq for DisguiseProfile {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DisguiseProfile {}

impl fmt::Display for DisguiseProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// Ordered set of usable disguises
///
/// Always non-empty and sorted by descending priority. Ties keep their
/// declaration order.
#[derive(Debug, Clone)]
pub struct Catalog {
    profiles: Vec<&'static DisguiseProfile>,
}

impl Catalog {
    /// The full built-in catalog
    pub fn builtin() -> Self {
        let mut profiles: Vec<&'static DisguiseProfile> = BUILTIN_PROFILES.iter().collect();
        profiles.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { profiles }
    }

    /// Restrict the built-in catalog to the given ids
    ///
    /// Unknown ids and an empty selection are rejected.
    pub fn with_enabled<S: AsRef<str>>(ids: &[S]) -> Result<Self, DisguiseError> {
        let builtin = Self::builtin();
        for id in ids {
            builtin.by_id(id.as_ref())?;
        }

        let profiles: Vec<_> = builtin
            .profiles
            .into_iter()
            .filter(|p| ids.iter().any(|id| id.as_ref() == p.id))
            .collect();

        Self::from_profiles(profiles)
    }

    /// Build a catalog from an explicit profile list
    pub fn from_profiles(
        mut profiles: Vec<&'static DisguiseProfile>,
    ) -> Result<Self, DisguiseError> {
        if profiles.is_empty() {
            return Err(DisguiseError::EmptyCatalog);
        }
        profiles.sort_by(|a, b| b.priority.cmp(&a.priority));
        profiles.dedup_by(|a, b| a.id == b.id);
        Ok(Self { profiles })
    }

    /// All profiles, highest priority first
    pub fn list_all(&self) -> &[&'static DisguiseProfile] {
        &self.profiles
    }

    /// Look up a profile by id
    pub fn by_id(&self, id: &str) -> Result<&'static DisguiseProfile, DisguiseError> {
        self.profiles
            .iter()
            .copied()
            .find(|p| p.id == id)
            .ok_or_else(|| DisguiseError::NotFound(id.to_string()))
    }

    /// The canonical (highest priority) profile
    pub fn canonical(&self) -> &'static DisguiseProfile {
        self.profiles[0]
    }

    /// Number of profiles
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Whether the catalog has no profiles
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}
