//! Backend registry and metadata
//!
//! Lists every backend the orchestrator knows how to drive and what each
//! one is able to do.

use std::fmt;

/// Backend used when nothing else is configured
pub const DEFAULT_BACKEND: &str = "qemu";

/// Information about a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInfo {
    /// Name used by the BACKEND variable
    pub name: &'static str,
    /// Brief description
    pub description: &'static str,
    /// Whether disk images can be pulled out of the machine after a run
    pub supports_asset_extraction: bool,
}

impl fmt::Display for BackendInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// All available backends
static BACKENDS: &[BackendInfo] = &[
    BackendInfo {
        name: "qemu",
        description: "Local QEMU/KVM virtual machine",
        supports_asset_extraction: true,
    },
    BackendInfo {
        name: "svirt",
        description: "Remote libvirt or hypervisor host over SSH",
        supports_asset_extraction: false,
    },
    BackendInfo {
        name: "generalhw",
        description: "Bare-metal machine controlled by user-supplied scripts",
        supports_asset_extraction: false,
    },
    BackendInfo {
        name: "ipmi",
        description: "Bare-metal machine controlled over IPMI",
        supports_asset_extraction: false,
    },
    BackendInfo {
        name: "null",
        description: "No machine at all, for tests that only run commands",
        supports_asset_extraction: false,
    },
];

/// Find a backend by name
pub fn lookup(name: &str) -> Option<&'static BackendInfo> {
    BACKENDS.iter().find(|b| b.name == name)
}

/// Comma-separated list of known backend names
pub fn known_names() -> String {
    BACKENDS.iter().map(|b| b.name).collect::<Vec<_>>().join(", ")
}
