// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Process-wide feature flags.
//!
//! Flags are set once during startup from the `publisher.features` table of the configuration,
//! before the server accepts any request, and are read-only afterwards. Flags that were never
//! set read as disabled.

use std::{collections::BTreeMap, sync::OnceLock};

static FEATURES: OnceLock<Features> = OnceLock::new();

/// An immutable set of feature flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Features {
    flags: BTreeMap<String, bool>,
}

impl Features {
    pub fn new(flags: BTreeMap<String, bool>) -> Self {
        Self { flags }
    }

    /// Returns true if `name` is present and set to true.
    pub fn enabled(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    /// Iterate over all configured flags, enabled or not.
    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.flags.iter().map(|(name, value)| (name.as_str(), *value))
    }
}

/// Install the process-wide feature flags.
///
/// # Errors
///
/// Flags may only be set once per process; subsequent calls return an error and leave the
/// original flags in place.
pub fn set(flags: BTreeMap<String, bool>) -> anyhow::Result<()> {
    FEATURES
        .set(Features::new(flags))
        .map_err(|_| anyhow::anyhow!("feature flags have already been set for this process"))
}

/// Get the process-wide feature flags.
pub fn get() -> &'static Features {
    static EMPTY: OnceLock<Features> = OnceLock::new();
    FEATURES
        .get()
        .unwrap_or_else(|| EMPTY.get_or_init(Features::default))
}

/// Returns true if the process-wide flag `name` is enabled.
pub fn enabled(name: &str) -> bool {
    get().enabled(name)
}
