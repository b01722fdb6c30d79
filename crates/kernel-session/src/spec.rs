//! Kernel spec discovery.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::backend::KernelBackend;
use crate::config::FALLBACK_KERNEL;
use crate::error::{Result, SessionError};

/// An installed kernel backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub argv: Vec<String>,
}

impl KernelSpec {
    pub fn new(name: &str, display_name: &str, language: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            language: language.map(str::to_string),
            argv: Vec::new(),
        }
    }
}

/// Result of a spec listing: every spec by name plus the default's name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpecs {
    pub specs: BTreeMap<String, KernelSpec>,
    pub default_name: String,
}

impl KernelSpecs {
    /// Collect specs and pick a default: `preferred` if listed, then
    /// `python3`, then the first name in sorted order.
    pub fn from_specs(
        specs: impl IntoIterator<Item = KernelSpec>,
        preferred: Option<&str>,
    ) -> Option<Self> {
        let specs: BTreeMap<String, KernelSpec> =
            specs.into_iter().map(|s| (s.name.clone(), s)).collect();

        let default_name = preferred
            .filter(|name| specs.contains_key(*name))
            .or_else(|| specs.contains_key(FALLBACK_KERNEL).then_some(FALLBACK_KERNEL))
            .or_else(|| specs.keys().next().map(String::as_str))?
            .to_string();

        Some(Self {
            specs,
            default_name,
        })
    }

    pub fn get(&self, name: &str) -> Option<&KernelSpec> {
        self.specs.get(name)
    }

    pub fn default_spec(&self) -> Option<&KernelSpec> {
        self.specs.get(&self.default_name)
    }

    /// First spec (default preferred) whose language matches, ignoring case.
    pub fn find_by_language(&self, language: &str) -> Option<&KernelSpec> {
        let matches = |spec: &&KernelSpec| {
            spec.language
                .as_deref()
                .is_some_and(|l| l.eq_ignore_ascii_case(language))
        };
        self.default_spec()
            .filter(matches)
            .or_else(|| self.specs.values().find(matches))
    }
}

/// Queries a backend for available kernel specs.
pub struct SpecResolver<'a, B> {
    backend: &'a B,
}

impl<'a, B: KernelBackend> SpecResolver<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    /// List the backend's specs.
    ///
    /// A default name that is not among the specs is reported as a
    /// `TransportError`; it is not corrected here.
    pub async fn list_specs(&self) -> Result<KernelSpecs> {
        let specs = self.backend.list_specs().await?;
        if !specs.specs.contains_key(&specs.default_name) {
            return Err(SessionError::TransportError(format!(
                "Default kernel spec {:?} is not among the listed specs",
                specs.default_name
            )));
        }
        debug!(
            "[spec] {} kernel specs, default={}",
            specs.specs.len(),
            specs.default_name
        );
        Ok(specs)
    }

    pub async fn default_spec(&self) -> Result<KernelSpec> {
        let specs = self.list_specs().await?;
        specs
            .default_spec()
            .cloned()
            .ok_or_else(|| SessionError::SpecUnavailable("No default kernel spec".to_string()))
    }
}
