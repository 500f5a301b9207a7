//! Machine configuration
//!
//! [`MachineConfig`] describes everything the VMM needs to assemble and boot
//! one guest: CPU/RAM sizing, the kernel image, the container process to run
//! under the synthesized init, and the optional static network setup.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Static IPv4 configuration handed to the guest init program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Guest address in CIDR notation, e.g. `10.42.0.2/24`.
    pub address: String,
    /// Default gateway, e.g. `10.42.0.1`.
    pub gateway: String,
    /// Nameserver written into `/etc/resolv.conf`.
    pub nameserver: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address: "10.42.0.2/24".into(),
            gateway: "10.42.0.1".into(),
            nameserver: "10.42.0.1".into(),
        }
    }
}

/// Configuration for a single guest VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Number of vCPUs, each driven by its own OS thread.
    pub vcpus: usize,
    /// Guest RAM in MiB.
    pub memory_mb: usize,
    /// Path to the kernel image (bzImage or ELF on x86, Image on ARM64).
    pub kernel: PathBuf,
    /// Extra kernel command line fragments appended to the built-in set.
    pub extra_cmdline: Option<String>,
    /// Mount tag advertised by the virtio-fs device.
    pub fs_tag: String,
    /// Hostname set by the guest init.
    pub hostname: String,
    /// Working directory for the container command.
    pub working_dir: String,
    /// Container argv; `argv[0]` is the program to exec.
    pub argv: Vec<String>,
    /// Container environment as `KEY=VALUE` strings.
    pub env: Vec<String>,
    /// Enable virtio-net and the static guest network config.
    pub network: Option<NetworkConfig>,
    /// Run the container command as PID 1 (plain execve) instead of
    /// fork+execve+waitpid under the init.
    pub pid1: bool,
    /// Pack a `/mem` character device node (major, minor) into the
    /// initramfs.
    pub mem_node: Option<(u32, u32)>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            vcpus: 1,
            memory_mb: 256,
            kernel: PathBuf::new(),
            extra_cmdline: None,
            fs_tag: "rootfs".into(),
            hostname: "cc".into(),
            working_dir: "/".into(),
            argv: vec![],
            env: vec![],
            network: None,
            pid1: false,
            mem_node: None,
        }
    }
}

impl MachineConfig {
    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.kernel = path.into();
        self
    }

    pub fn memory_mb(mut self, mb: usize) -> Self {
        self.memory_mb = mb;
        self
    }

    pub fn vcpus(mut self, n: usize) -> Self {
        self.vcpus = n;
        self
    }

    pub fn argv(mut self, argv: Vec<String>) -> Self {
        self.argv = argv;
        self
    }

    /// The kernel command line: quiet console-on-serial defaults plus any
    /// user-supplied extras.
    pub fn kernel_cmdline(&self) -> String {
        let console = if cfg!(target_arch = "aarch64") {
            "console=ttyS0 earlycon=uart8250,mmio32,0x9000000"
        } else {
            "console=ttyS0 reboot=k panic=-1"
        };
        let mut cmdline = format!("{console} quiet rootwait");
        if let Some(extra) = &self.extra_cmdline {
            cmdline.push(' ');
            cmdline.push_str(extra);
        }
        cmdline
    }

    /// Validate the configuration before any host resources are touched.
    pub fn validate(&self) -> Result<()> {
        if self.vcpus == 0 {
            return Err(Error::Config("vcpus must be at least 1".into()));
        }
        if self.memory_mb < 32 {
            return Err(Error::Config(format!(
                "memory_mb {} is below the 32 MiB minimum",
                self.memory_mb
            )));
        }
        if self.kernel.as_os_str().is_empty() {
            return Err(Error::Config("kernel image path is required".into()));
        }
        if self.argv.is_empty() {
            return Err(Error::Config("argv must name a program to run".into()));
        }
        if self.fs_tag.is_empty() || self.fs_tag.len() > 36 || !self.fs_tag.is_ascii() {
            return Err(Error::Config(format!(
                "fs_tag {:?} must be 1..=36 ASCII bytes",
                self.fs_tag
            )));
        }
        for kv in &self.env {
            if !kv.contains('=') {
                return Err(Error::Config(format!("env entry {kv:?} is not KEY=VALUE")));
            }
        }
        Ok(())
    }
}
