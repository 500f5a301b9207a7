//! cc-vmm: a user-space VMM that boots container filesystems
//!
//! Given a kernel image and a root filesystem, `cc-vmm` assembles a
//! hardware-accelerated micro-VM: the root is served over virtio-fs, a
//! minimal Linux kernel boots with a synthesized `/init` (compiled at
//! runtime from an architecture-neutral IR), and the requested process runs
//! inside with optional user-space networking.
//!
//! # Example
//!
//! ```no_run
//! use cc_vmm::{fs::PassthroughFs, Machine, MachineConfig};
//! use cc_vmm::vmm::ConsoleEndpoints;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MachineConfig::default()
//!         .kernel("/path/to/vmlinuz")
//!         .memory_mb(256)
//!         .argv(vec!["/bin/sh".into(), "-c".into(), "echo hello".into()]);
//!     let fs = Box::new(PassthroughFs::new("/path/to/rootfs"));
//!     let mut machine = Machine::new(&config, fs, None, ConsoleEndpoints::default())?;
//!     let outcome = machine.run()?;
//!     println!("guest finished: {outcome:?}");
//!     Ok(())
//! }
//! ```

pub mod boot;
pub mod codegen;
pub mod config;
pub mod devices;
pub mod error;
pub mod fs;
pub mod guest;
pub mod hv;
pub mod memory;
pub mod net;
pub mod vmm;

pub use config::{MachineConfig, NetworkConfig};
pub use error::{Error, Result, RunOutcome};
pub use memory::GuestRam;
pub use vmm::Machine;
