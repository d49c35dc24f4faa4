// src/model/launch.rs
//! Launch configuration for agent processes

use crate::model::run::TestPackage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Requested process bitness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bitness {
    #[default]
    Any,
    X86,
    X64,
}

impl Bitness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bitness::Any => "any",
            Bitness::X86 => "x86",
            Bitness::X64 => "x64",
        }
    }
}

impl fmt::Display for Bitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Bitness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(Bitness::Any),
            "x86" | "32" => Ok(Bitness::X86),
            "x64" | "64" => Ok(Bitness::X64),
            other => Err(format!("unknown bitness '{}', expected any, x86 or x64", other)),
        }
    }
}

/// Target runtime an agent must host
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeTarget {
    /// Framework moniker, e.g. `net-8.0`
    pub framework: String,

    #[serde(default)]
    pub bitness: Bitness,
}

impl RuntimeTarget {
    pub fn new(framework: impl Into<String>) -> Self {
        Self {
            framework: framework.into(),
            bitness: Bitness::Any,
        }
    }

    pub fn with_bitness(mut self, bitness: Bitness) -> Self {
        self.bitness = bitness;
        self
    }

    /// Key used to look up per-runtime executable overrides
    pub fn key(&self) -> String {
        match self.bitness {
            Bitness::Any => self.framework.clone(),
            bitness => format!("{}-{}", self.framework, bitness),
        }
    }
}

impl Default for RuntimeTarget {
    fn default() -> Self {
        Self::new("any")
    }
}

impl fmt::Display for RuntimeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// How agents are shared between runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessIsolation {
    /// Agent returns to the pool after each run
    #[default]
    Shared,

    /// Agent is retired after the run it served
    PerRun,
}

/// Immutable description of the agent a run needs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaunchConfiguration {
    pub runtime: RuntimeTarget,

    #[serde(default)]
    pub isolation: ProcessIsolation,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Environment overrides for the agent process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl LaunchConfiguration {
    pub fn for_runtime(runtime: RuntimeTarget) -> Self {
        Self {
            runtime,
            isolation: ProcessIsolation::Shared,
            working_dir: None,
            extra_args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Derive the launch configuration a test package asks for
    pub fn for_package(package: &TestPackage) -> Self {
        Self {
            runtime: package.runtime.clone(),
            isolation: package.isolation,
            working_dir: package.working_dir.clone(),
            extra_args: Vec::new(),
            env: package.env.clone(),
        }
    }
}

impl Default for LaunchConfiguration {
    fn default() -> Self {
        Self::for_runtime(RuntimeTarget::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_key() {
        assert_eq!(RuntimeTarget::new("net-8.0").key(), "net-8.0");
        assert_eq!(
            RuntimeTarget::new("net-4.8").with_bitness(Bitness::X86).key(),
            "net-4.8-x86"
        );
    }

    #[test]
    fn test_bitness_parse() {
        assert_eq!("X64".parse::<Bitness>().unwrap(), Bitness::X64);
        assert_eq!("32".parse::<Bitness>().unwrap(), Bitness::X86);
        assert!("arm".parse::<Bitness>().is_err());
    }

    #[test]
    fn test_for_package() {
        let mut package = TestPackage::new(vec![PathBuf::from("suite.json")])
            .with_runtime(RuntimeTarget::new("net-8.0"));
        package.isolation = ProcessIsolation::PerRun;
        package.env.insert("LANG".into(), "C".into());

        let launch = LaunchConfiguration::for_package(&package);
        assert_eq!(launch.runtime.framework, "net-8.0");
        assert_eq!(launch.isolation, ProcessIsolation::PerRun);
        assert_eq!(launch.env.get("LANG").map(String::as_str), Some("C"));
    }

    #[test]
    fn test_equal_configurations_match() {
        let a = LaunchConfiguration::for_runtime(RuntimeTarget::new("net-8.0"));
        let b = LaunchConfiguration::for_runtime(RuntimeTarget::new("net-8.0"));
        let c = LaunchConfiguration::for_runtime(RuntimeTarget::new("net-6.0"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
