//! Hypervisor abstraction
//!
//! A backend-independent surface over the host accelerator: open the
//! hypervisor, create a VM with one RAM window, drive vCPUs and read their
//! registers by tag. Backends are selected by host OS/arch at [`open`] time;
//! capability differences (x86 MSI delivery, the ARM64 GIC layout) are
//! probed dynamically, not compiled in.

#[cfg(target_os = "linux")]
pub mod kvm;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::devices::ioapic::MsiMessage;
use crate::memory::GuestRam;
use crate::Result;

/// Named register tags. Values are always 64-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Reg {
    // x86-64
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rsp,
    Rbp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,
    // ARM64
    X(u8),
    Sp,
    Pc,
    Pstate,
}

/// A register snapshot or update: only the tags present are touched.
pub type RegMap = BTreeMap<Reg, u64>;

/// The general registers of the current architecture, for fatal dumps.
pub fn general_regs() -> Vec<Reg> {
    if cfg!(target_arch = "aarch64") {
        let mut v: Vec<Reg> = (0..31).map(Reg::X).collect();
        v.extend([Reg::Sp, Reg::Pc, Reg::Pstate]);
        v
    } else {
        vec![
            Reg::Rax,
            Reg::Rbx,
            Reg::Rcx,
            Reg::Rdx,
            Reg::Rsi,
            Reg::Rdi,
            Reg::Rsp,
            Reg::Rbp,
            Reg::R8,
            Reg::R9,
            Reg::R10,
            Reg::R11,
            Reg::R12,
            Reg::R13,
            Reg::R14,
            Reg::R15,
            Reg::Rip,
            Reg::Rflags,
        ]
    }
}

/// The instruction-pointer tag for the current architecture.
pub fn pc_reg() -> Reg {
    if cfg!(target_arch = "aarch64") {
        Reg::Pc
    } else {
        Reg::Rip
    }
}

/// Why a vCPU stopped running.
#[derive(Debug)]
pub enum VcpuExit<'a> {
    /// Halt with interrupts disabled.
    Halted,
    /// The guest asked for a reset (triple fault, PSCI, shutdown event).
    RebootRequest,
    PortIn { port: u16, data: &'a mut [u8] },
    PortOut { port: u16, data: &'a [u8] },
    MmioRead { gpa: u64, data: &'a mut [u8] },
    MmioWrite { gpa: u64, data: &'a [u8] },
    /// Irqchip-specific signal: a level-triggered EOI broadcast.
    EoiBroadcast { vector: u8 },
    /// `run` was interrupted by a host signal (cancellation kick).
    Interrupted,
}

/// How the first instructions of a vCPU are set up, per architecture.
#[derive(Debug, Clone, Copy)]
pub enum EntryState {
    X86 {
        rip: u64,
        /// boot_params GPA, handed over in RSI.
        zero_page: u64,
        /// Identity page table root for the 64-bit entry.
        page_table: u64,
    },
    Arm64 {
        pc: u64,
        /// FDT GPA, handed over in X0.
        fdt: u64,
    },
}

/// One virtual CPU, owned by its run-loop thread.
pub trait Vcpu: Send {
    fn id(&self) -> usize;

    /// Program the boot entry state (registers, control state, local APIC
    /// or EL1 setup as the architecture demands).
    fn configure(&mut self, entry: &EntryState) -> Result<()>;

    /// Run until the next exit. Blocks the calling OS thread.
    fn run(&mut self) -> Result<VcpuExit<'_>>;

    /// Read the registers named by `tags`.
    fn get_regs(&self, tags: &[Reg]) -> Result<RegMap>;

    /// Write the registers present in `regs`.
    fn set_regs(&self, regs: &RegMap) -> Result<()>;
}

/// Concrete GIC frame layout exposed by ARM64-capable backends.
#[derive(Debug, Clone, Copy)]
pub struct GicLayout {
    pub dist_base: u64,
    pub dist_size: u64,
    pub redist_base: u64,
    pub redist_size: u64,
    pub maintenance_irq: u32,
}

/// A VM instance: fixed CPU count, one RAM window, interrupt plumbing.
pub trait VirtualMachine: Send + Sync {
    fn ram(&self) -> &GuestRam;

    fn num_vcpus(&self) -> usize;

    /// Hand the vCPU to its run-loop thread. Each id can be taken once.
    fn take_vcpu(&self, id: usize) -> Result<Box<dyn Vcpu>>;

    /// x86 capability: deliver an MSI-style message to the local APICs.
    /// Backends without one return `Error::Config`.
    fn signal_msi(&self, msi: MsiMessage) -> Result<()>;

    /// ARM64 capability: drive a shared peripheral interrupt line.
    fn set_spi(&self, intid: u32, high: bool) -> Result<()>;

    /// ARM64 capability: the in-kernel GIC frames, if the backend has one.
    fn gic_layout(&self) -> Option<GicLayout>;
}

/// Sizing for a new VM.
#[derive(Debug, Clone, Copy)]
pub struct VmSpec {
    pub num_vcpus: usize,
    pub mem_base: u64,
    pub mem_size: u64,
}

/// An opened host accelerator.
pub trait Hypervisor: Send {
    fn name(&self) -> &'static str;
    fn create_vm(&self, spec: &VmSpec) -> Result<Arc<dyn VirtualMachine>>;
}

/// Open the host accelerator for this OS/arch.
///
/// Hosts without a supported backend get `Error::HypervisorUnsupported`;
/// the macOS (HVF) and Windows (WHP) slots in this factory are unpopulated.
pub fn open() -> Result<Box<dyn Hypervisor>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(kvm::KvmHypervisor::open()?))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(crate::Error::HypervisorUnsupported)
    }
}

/// An interrupt line that delivers through a VM capability (SPI on ARM64).
pub struct VmSpiLine {
    vm: Arc<dyn VirtualMachine>,
    intid: u32,
}

impl VmSpiLine {
    pub fn new(vm: Arc<dyn VirtualMachine>, intid: u32) -> Arc<Self> {
        Arc::new(Self { vm, intid })
    }
}

impl crate::devices::InterruptLine for VmSpiLine {
    fn set_level(&self, high: bool) {
        let _ = self.vm.set_spi(self.intid, high);
    }
}

/// MSI delivery sink backed by a VM, for the IOAPIC.
pub struct VmMsiSink {
    vm: Arc<dyn VirtualMachine>,
}

impl VmMsiSink {
    pub fn new(vm: Arc<dyn VirtualMachine>) -> Arc<Self> {
        Arc::new(Self { vm })
    }
}

impl crate::devices::ioapic::InterruptDelivery for VmMsiSink {
    fn deliver(&self, msi: MsiMessage) {
        if let Err(e) = self.vm.signal_msi(msi) {
            tracing::error!(error = %e, "MSI delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_tags_are_ordered_map_keys() {
        let mut map = RegMap::new();
        map.insert(Reg::Rip, 0x1000);
        map.insert(Reg::Rax, 5);
        map.insert(Reg::X(3), 7);
        assert_eq!(map.get(&Reg::Rip), Some(&0x1000));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn general_regs_match_arch() {
        let regs = general_regs();
        if cfg!(target_arch = "aarch64") {
            assert!(regs.contains(&Reg::Pc));
            assert_eq!(regs.len(), 34);
        } else {
            assert!(regs.contains(&Reg::Rip));
            assert_eq!(regs.len(), 18);
        }
    }
}
