//! Host environment snapshot for the manifest.

use sysinfo::System;

use crate::manifest::{EnvironmentMetadata, SystemMetadata, ToolsMetadata};

/// Collect OS name, OS version, hostname and the tool version.
///
/// Every field falls back to `"Unknown"` when the host refuses to tell us;
/// this function never fails.
pub fn collect_environment() -> EnvironmentMetadata {
    EnvironmentMetadata {
        system: SystemMetadata {
            os: System::name().unwrap_or_else(unknown),
            os_version: System::os_version().unwrap_or_else(unknown),
            hostname: System::host_name().unwrap_or_else(unknown),
        },
        tools: ToolsMetadata {
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    }
}

fn unknown() -> String {
    "Unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_environment_never_empty() {
        let env = collect_environment();
        assert!(!env.system.os.is_empty());
        assert!(!env.system.os_version.is_empty());
        assert!(!env.system.hostname.is_empty());
        assert_eq!(env.tools.version, env!("CARGO_PKG_VERSION"));
    }
}
