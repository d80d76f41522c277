//! Attestor registry.
//!
//! Maps attestor names and type URIs to factories and configurable
//! options. Build one at startup, then share it read-only behind an
//! `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::attestor::{Attestor, RunType};
use crate::error::AttestationError;

type Factory = Box<dyn Fn() -> Box<dyn Attestor> + Send + Sync>;
type Setter = Box<dyn Fn(&mut dyn Attestor, Value) -> Result<(), AttestationError> + Send + Sync>;

/// A named, typed configuration parameter of an attestor.
pub struct AttestorOption {
    name: String,
    description: String,
    default: Value,
    setter: Setter,
}

impl AttestorOption {
    /// Declare an option for attestor type `A` with value type `T`.
    ///
    /// `setter` receives the deserialized value; it may reject values by
    /// returning an error.
    pub fn new<A, T, F>(name: &str, description: &str, default: T, setter: F) -> Self
    where
        A: Attestor + 'static,
        T: Serialize + DeserializeOwned + 'static,
        F: Fn(&mut A, T) -> Result<(), AttestationError> + Send + Sync + 'static,
    {
        let option_name = name.to_owned();
        let setter = move |attestor: &mut dyn Attestor, value: Value| {
            let typed: T = serde_json::from_value(value).map_err(|e| {
                AttestationError::InvalidOption(format!("{option_name}: {e}"))
            })?;
            let concrete = attestor.as_any_mut().downcast_mut::<A>().ok_or_else(|| {
                AttestationError::InvalidOption(format!(
                    "{option_name}: option applied to the wrong attestor type"
                ))
            })?;
            setter(concrete, typed)
        };

        Self {
            name: name.to_owned(),
            description: description.to_owned(),
            default: serde_json::to_value(default).unwrap_or_default(),
            setter: Box::new(setter),
        }
    }

    /// Option name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Default value as JSON.
    #[must_use]
    pub fn default_value(&self) -> &Value {
        &self.default
    }

    fn apply(&self, attestor: &mut dyn Attestor, value: Value) -> Result<(), AttestationError> {
        (self.setter)(attestor, value)
    }
}

impl fmt::Debug for AttestorOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttestorOption")
            .field("name", &self.name)
            .field("default", &self.default)
            .finish_non_exhaustive()
    }
}

/// One registered attestor.
pub struct RegistryEntry {
    name: String,
    type_uri: String,
    run_type: RunType,
    factory: Factory,
    options: Vec<AttestorOption>,
}

impl RegistryEntry {
    /// Attestor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attestor type URI.
    #[must_use]
    pub fn type_uri(&self) -> &str {
        &self.type_uri
    }

    /// Phase the attestor runs in.
    #[must_use]
    pub const fn run_type(&self) -> RunType {
        self.run_type
    }

    /// Options in registration order.
    #[must_use]
    pub fn options(&self) -> &[AttestorOption] {
        &self.options
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name)
            .field("type_uri", &self.type_uri)
            .field("run_type", &self.run_type)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Table of known attestors, addressable by name or type URI.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<RegistryEntry>,
    by_name: HashMap<String, usize>,
    by_type: HashMap<String, usize>,
}

impl Registry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in attestor.
    pub fn with_builtins() -> Result<Self, AttestationError> {
        let mut registry = Self::new();
        crate::attestors::register_builtins(&mut registry)?;
        Ok(registry)
    }

    /// Register `A`, deriving its name, type, and phase from a default
    /// instance.
    pub fn register<A>(&mut self, options: Vec<AttestorOption>) -> Result<(), AttestationError>
    where
        A: Attestor + Default + 'static,
    {
        self.register_with(|| Box::new(A::default()), options)
    }

    /// Register an attestor built by `factory`.
    ///
    /// A name or type URI that is already registered is rejected.
    pub fn register_with<F>(
        &mut self,
        factory: F,
        options: Vec<AttestorOption>,
    ) -> Result<(), AttestationError>
    where
        F: Fn() -> Box<dyn Attestor> + Send + Sync + 'static,
    {
        let probe = factory();
        let name = probe.name().to_owned();
        let type_uri = probe.type_uri().to_owned();

        if self.by_name.contains_key(&name) {
            return Err(AttestationError::DuplicateAttestor(name));
        }
        if self.by_type.contains_key(&type_uri) {
            return Err(AttestationError::DuplicateAttestor(type_uri));
        }

        let idx = self.entries.len();
        self.by_name.insert(name.clone(), idx);
        self.by_type.insert(type_uri.clone(), idx);
        self.entries.push(RegistryEntry {
            name,
            type_uri,
            run_type: probe.run_type(),
            factory: Box::new(factory),
            options,
        });
        Ok(())
    }

    /// Look up an entry by name or type URI.
    #[must_use]
    pub fn entry(&self, name_or_type: &str) -> Option<&RegistryEntry> {
        self.by_name
            .get(name_or_type)
            .or_else(|| self.by_type.get(name_or_type))
            .map(|&idx| &self.entries[idx])
    }

    /// All entries in registration order.
    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter()
    }

    /// Instantiate attestors by name or type, each with its option
    /// defaults applied in registration order.
    pub fn attestors(&self, names: &[&str]) -> Result<Vec<Box<dyn Attestor>>, AttestationError> {
        names
            .iter()
            .map(|name| self.instantiate(name, &BTreeMap::new()))
            .collect()
    }

    /// Instantiate one attestor, applying defaults then `overrides`.
    ///
    /// Override keys that are not options of the attestor are rejected.
    pub fn instantiate(
        &self,
        name_or_type: &str,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<Box<dyn Attestor>, AttestationError> {
        let entry = self
            .entry(name_or_type)
            .ok_or_else(|| AttestationError::UnknownAttestor(name_or_type.to_owned()))?;

        if let Some(unknown) = overrides
            .keys()
            .find(|key| !entry.options.iter().any(|o| &o.name == *key))
        {
            return Err(AttestationError::InvalidOption(format!(
                "attestor `{}` has no option `{unknown}`",
                entry.name
            )));
        }

        let mut attestor = (entry.factory)();
        for option in &entry.options {
            option.apply(attestor.as_mut(), option.default.clone())?;
        }
        for option in &entry.options {
            if let Some(value) = overrides.get(&option.name) {
                option.apply(attestor.as_mut(), value.clone())?;
            }
        }
        Ok(attestor)
    }

    /// A blank attestor of `type_uri`, for loading recorded state.
    #[must_use]
    pub fn factory_by_type(&self, type_uri: &str) -> Option<Box<dyn Attestor>> {
        self.by_type
            .get(type_uri)
            .map(|&idx| (self.entries[idx].factory)())
    }
}
