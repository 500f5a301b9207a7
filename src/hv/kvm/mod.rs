//! KVM backend (Linux)
//!
//! x86-64 runs with the split irqchip: the local APICs stay in the kernel,
//! while this crate's PIC/IOAPIC/PIT/HPET provide the platform interrupt
//! logic, delivering through `KVM_SIGNAL_MSI` and receiving EOI broadcast
//! exits. ARM64 uses the in-kernel vGICv3 and reports its frame layout
//! through the architecture sub-trait.

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x86_64;

use std::sync::{Arc, Mutex};

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::{Kvm, VcpuFd, VmFd};
use tracing::{debug, info};

use super::{
    EntryState, GicLayout, Hypervisor, Reg, RegMap, Vcpu, VcpuExit, VirtualMachine, VmSpec,
};
use crate::devices::ioapic::MsiMessage;
use crate::memory::GuestRam;
use crate::{Error, Result};

pub struct KvmHypervisor {
    kvm: Kvm,
}

impl KvmHypervisor {
    /// Open /dev/kvm. A missing or unopenable device means this host has no
    /// usable accelerator, which callers treat distinctly.
    pub fn open() -> Result<Self> {
        match Kvm::new() {
            Ok(kvm) => {
                debug!(api = kvm.get_api_version(), "opened /dev/kvm");
                Ok(Self { kvm })
            }
            Err(e) if e.errno() == libc::ENOENT || e.errno() == libc::EACCES => {
                Err(Error::HypervisorUnsupported)
            }
            Err(e) => Err(Error::Kvm(e)),
        }
    }
}

impl Hypervisor for KvmHypervisor {
    fn name(&self) -> &'static str {
        "kvm"
    }

    fn create_vm(&self, spec: &VmSpec) -> Result<Arc<dyn VirtualMachine>> {
        let vm_fd = self.kvm.create_vm()?;
        let ram = GuestRam::new(spec.mem_base, spec.mem_size)?;

        let region = kvm_userspace_memory_region {
            slot: 0,
            guest_phys_addr: ram.base(),
            memory_size: ram.size(),
            userspace_addr: ram.host_addr(ram.base())? as u64,
            flags: 0,
        };
        // SAFETY: the mmap behind `ram` lives as long as the VM that owns it.
        unsafe {
            vm_fd.set_user_memory_region(region)?;
        }

        #[cfg(target_arch = "x86_64")]
        let vm = x86_64::finish_vm(&self.kvm, vm_fd, ram, spec)?;
        #[cfg(target_arch = "aarch64")]
        let vm = aarch64::finish_vm(&self.kvm, vm_fd, ram, spec)?;
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            let _ = (vm_fd, ram);
            return Err(Error::HypervisorUnsupported);
        }

        info!(
            vcpus = spec.num_vcpus,
            mem = format_args!("{:#x}", spec.mem_size),
            "created KVM VM"
        );
        Ok(vm)
    }
}

/// Shared VM state for both architectures.
pub struct KvmVm {
    vm_fd: VmFd,
    ram: GuestRam,
    vcpus: Mutex<Vec<Option<VcpuFd>>>,
    gic: Option<GicLayout>,
    #[cfg(target_arch = "x86_64")]
    cpuid: kvm_bindings::CpuId,
}

impl VirtualMachine for KvmVm {
    fn ram(&self) -> &GuestRam {
        &self.ram
    }

    fn num_vcpus(&self) -> usize {
        self.vcpus.lock().unwrap().len()
    }

    fn take_vcpu(&self, id: usize) -> Result<Box<dyn Vcpu>> {
        let fd = self
            .vcpus
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(Option::take)
            .ok_or_else(|| Error::Config(format!("vCPU {id} does not exist or was taken")))?;
        Ok(Box::new(KvmVcpu {
            id,
            fd,
            #[cfg(target_arch = "x86_64")]
            cpuid: self.cpuid.clone(),
        }))
    }

    fn signal_msi(&self, msi: MsiMessage) -> Result<()> {
        #[cfg(target_arch = "x86_64")]
        {
            let msg = kvm_bindings::kvm_msi {
                address_lo: msi.address as u32,
                address_hi: (msi.address >> 32) as u32,
                data: msi.data,
                ..Default::default()
            };
            self.vm_fd.signal_msi(msg)?;
            Ok(())
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = msi;
            Err(Error::Config("backend has no MSI delivery".into()))
        }
    }

    fn set_spi(&self, intid: u32, high: bool) -> Result<()> {
        #[cfg(target_arch = "aarch64")]
        {
            // KVM_ARM_IRQ_TYPE_SPI in the irq encoding's type field.
            let irq = (1u32 << 24) | intid;
            self.vm_fd.set_irq_line(irq, high)?;
            Ok(())
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            let _ = (intid, high);
            Err(Error::Config("backend has no SPI lines".into()))
        }
    }

    fn gic_layout(&self) -> Option<GicLayout> {
        self.gic
    }
}

/// One KVM vCPU and the state needed to configure it.
pub struct KvmVcpu {
    id: usize,
    fd: VcpuFd,
    #[cfg(target_arch = "x86_64")]
    cpuid: kvm_bindings::CpuId,
}

impl Vcpu for KvmVcpu {
    fn id(&self) -> usize {
        self.id
    }

    fn configure(&mut self, entry: &EntryState) -> Result<()> {
        #[cfg(target_arch = "x86_64")]
        return x86_64::configure_vcpu(self, entry);
        #[cfg(target_arch = "aarch64")]
        return aarch64::configure_vcpu(self, entry);
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            let _ = entry;
            Err(Error::HypervisorUnsupported)
        }
    }

    fn run(&mut self) -> Result<VcpuExit<'_>> {
        use kvm_ioctls::VcpuExit as K;
        match self.fd.run() {
            Ok(exit) => Ok(match exit {
                K::IoIn(port, data) => VcpuExit::PortIn { port, data },
                K::IoOut(port, data) => VcpuExit::PortOut { port, data },
                K::MmioRead(gpa, data) => VcpuExit::MmioRead { gpa, data },
                K::MmioWrite(gpa, data) => VcpuExit::MmioWrite { gpa, data },
                K::Hlt => VcpuExit::Halted,
                K::Shutdown => VcpuExit::RebootRequest,
                K::SystemEvent(_, _) => VcpuExit::RebootRequest,
                #[cfg(target_arch = "x86_64")]
                K::IoapicEoi(vector) => VcpuExit::EoiBroadcast { vector },
                K::Intr => VcpuExit::Interrupted,
                other => {
                    return Err(Error::Guest(format!(
                        "unhandled vCPU exit: {other:?}"
                    )))
                }
            }),
            Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => {
                Ok(VcpuExit::Interrupted)
            }
            Err(e) => Err(Error::Kvm(e)),
        }
    }

    fn get_regs(&self, tags: &[Reg]) -> Result<RegMap> {
        #[cfg(target_arch = "x86_64")]
        return x86_64::get_regs(self, tags);
        #[cfg(target_arch = "aarch64")]
        return aarch64::get_regs(self, tags);
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            let _ = tags;
            Err(Error::HypervisorUnsupported)
        }
    }

    fn set_regs(&self, regs: &RegMap) -> Result<()> {
        #[cfg(target_arch = "x86_64")]
        return x86_64::set_regs(self, regs);
        #[cfg(target_arch = "aarch64")]
        return aarch64::set_regs(self, regs);
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            let _ = regs;
            Err(Error::HypervisorUnsupported)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Requires KVM
    fn create_vm_and_take_vcpu() {
        let hv = KvmHypervisor::open().expect("KVM available");
        let vm = hv
            .create_vm(&VmSpec {
                num_vcpus: 1,
                mem_base: 0,
                mem_size: 64 * 1024 * 1024,
            })
            .unwrap();
        assert_eq!(vm.num_vcpus(), 1);
        let vcpu = vm.take_vcpu(0).unwrap();
        assert_eq!(vcpu.id(), 0);
        // Taking the same vCPU twice fails.
        assert!(vm.take_vcpu(0).is_err());
    }

    #[test]
    #[ignore] // Requires KVM
    fn guest_ram_is_shared_with_the_vm() {
        let hv = KvmHypervisor::open().expect("KVM available");
        let vm = hv
            .create_vm(&VmSpec {
                num_vcpus: 1,
                mem_base: 0,
                mem_size: 16 * 1024 * 1024,
            })
            .unwrap();
        vm.ram().write_at(0x1000, b"shared").unwrap();
        let mut buf = [0u8; 6];
        vm.ram().read_at(0x1000, &mut buf).unwrap();
        assert_eq!(&buf, b"shared");
    }
}
