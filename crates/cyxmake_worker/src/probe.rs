//! Host and toolchain probing, reported once in HELLO.

use cyxmake_protocol::{Capabilities, SystemInfo, ToolInfo};
use std::collections::BTreeMap;
use std::process::Command;
use sysinfo::Disks;
use tracing::debug;

const PROBED_TOOLS: &[&str] = &[
    "cc", "c++", "gcc", "g++", "clang", "clang++", "make", "cmake", "ninja", "ld",
];

pub fn probe_system() -> SystemInfo {
    let sys = sysinfo::System::new_all();

    let disk_free_mb = Disks::new_with_refreshed_list()
        .list()
        .iter()
        .map(|d| d.available_space())
        .max()
        .unwrap_or(0)
        / (1024 * 1024);

    SystemInfo {
        arch: std::env::consts::ARCH.to_string(),
        os: std::env::consts::OS.to_string(),
        os_version: sysinfo::System::os_version().unwrap_or_default(),
        cpu_cores: num_cpus::get_physical() as u32,
        cpu_threads: num_cpus::get() as u32,
        memory_mb: sys.total_memory() / (1024 * 1024),
        disk_free_mb,
    }
}

/// Find build tools on PATH and capture their version banner.
pub fn discover_tools() -> BTreeMap<String, ToolInfo> {
    let mut tools = BTreeMap::new();
    for name in PROBED_TOOLS {
        let Ok(path) = which::which(name) else {
            continue;
        };
        let version = Command::new(&path)
            .arg("--version")
            .output()
            .ok()
            .and_then(|out| {
                String::from_utf8(out.stdout)
                    .ok()
                    .and_then(|text| text.lines().next().map(str::to_string))
            })
            .unwrap_or_default();
        debug!("found tool {} at {} ({})", name, path.display(), version);
        tools.insert(name.to_string(), ToolInfo { path, version });
    }
    tools
}

/// Capability bits implied by the discovered toolchain.
pub fn derive_capabilities(tools: &BTreeMap<String, ToolInfo>) -> Capabilities {
    let mut caps = Capabilities::NONE;
    let has = |name: &str| tools.contains_key(name);

    if has("cc") || has("gcc") || has("clang") {
        caps.insert(Capabilities::COMPILE_C);
        caps.insert(Capabilities::LINK);
    }
    if has("c++") || has("g++") || has("clang++") {
        caps.insert(Capabilities::COMPILE_CPP);
        caps.insert(Capabilities::LINK);
    }
    if has("cmake") {
        caps.insert(Capabilities::CMAKE);
    }
    if has("ninja") {
        caps.insert(Capabilities::NINJA);
    }
    if has("make") {
        caps.insert(Capabilities::MAKE);
    }
    caps
}

/// Live load readings for heartbeats.
pub struct LoadProbe {
    sys: sysinfo::System,
}

impl LoadProbe {
    pub fn new() -> Self {
        Self {
            sys: sysinfo::System::new(),
        }
    }

    /// (cpu fraction, memory fraction), both in [0, 1].
    pub fn sample(&mut self) -> (f64, f64) {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        let cpu = f64::from(self.sys.global_cpu_usage()) / 100.0;
        let memory = if self.sys.total_memory() == 0 {
            0.0
        } else {
            self.sys.used_memory() as f64 / self.sys.total_memory() as f64
        };
        (cpu.clamp(0.0, 1.0), memory.clamp(0.0, 1.0))
    }
}

impl Default for LoadProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_system_fields_populated() {
        let info = probe_system();
        assert!(!info.arch.is_empty());
        assert!(!info.os.is_empty());
        assert!(info.cpu_threads >= info.cpu_cores);
        assert!(info.cpu_cores >= 1);
    }

    #[test]
    fn test_derive_capabilities_from_tools() {
        let mut tools = BTreeMap::new();
        tools.insert(
            "cc".to_string(),
            ToolInfo {
                path: "/usr/bin/cc".into(),
                version: "cc 12.0".to_string(),
            },
        );
        tools.insert(
            "cmake".to_string(),
            ToolInfo {
                path: "/usr/bin/cmake".into(),
                version: "cmake 3.28".to_string(),
            },
        );
        let caps = derive_capabilities(&tools);
        assert!(caps.contains(Capabilities::COMPILE_C));
        assert!(caps.contains(Capabilities::LINK));
        assert!(caps.contains(Capabilities::CMAKE));
        assert!(!caps.contains(Capabilities::COMPILE_CPP));
        assert!(!caps.contains(Capabilities::NINJA));
    }

    #[test]
    fn test_load_probe_sample_bounded() {
        let mut probe = LoadProbe::new();
        let (cpu, memory) = probe.sample();
        assert!((0.0..=1.0).contains(&cpu));
        assert!((0.0..=1.0).contains(&memory));
    }
}
