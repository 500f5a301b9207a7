//! KVM x86-64 specifics: split irqchip, long-mode entry, register mapping

use std::sync::{Arc, Mutex};

use kvm_bindings::{
    kvm_enable_cap, kvm_regs, KVM_CAP_SPLIT_IRQCHIP, KVM_MAX_CPUID_ENTRIES,
};
use kvm_ioctls::{Cap, Kvm, VmFd};
use tracing::debug;

use super::{KvmVcpu, KvmVm};
use crate::devices::ioapic;
use crate::hv::{EntryState, Reg, RegMap, VmSpec};
use crate::memory::GuestRam;
use crate::{Error, Result};

/// Segment selector/type values for the flat long-mode layout.
mod seg {
    pub const CODE_SELECTOR: u16 = 0x10;
    pub const DATA_SELECTOR: u16 = 0x18;
    pub const CODE_TYPE: u8 = 0x0b;
    pub const DATA_TYPE: u8 = 0x03;

    pub const CR0_PE: u64 = 1 << 0;
    pub const CR0_PG: u64 = 1 << 31;
    pub const CR4_PAE: u64 = 1 << 5;
    pub const EFER_LME: u64 = 1 << 8;
    pub const EFER_LMA: u64 = 1 << 10;
}

/// Finish VM construction: split irqchip, then the vCPU set.
pub fn finish_vm(kvm: &Kvm, vm_fd: VmFd, ram: GuestRam, spec: &VmSpec) -> Result<Arc<KvmVm>> {
    if !kvm.check_extension(Cap::SplitIrqchip) {
        return Err(Error::Config(
            "KVM lacks KVM_CAP_SPLIT_IRQCHIP; the user-space IOAPIC needs it".into(),
        ));
    }
    let mut cap = kvm_enable_cap {
        cap: KVM_CAP_SPLIT_IRQCHIP,
        ..Default::default()
    };
    cap.args[0] = ioapic::NUM_PINS as u64;
    vm_fd.enable_cap(&cap)?;
    debug!(pins = ioapic::NUM_PINS, "enabled split irqchip");

    vm_fd.set_tss_address(0xfffb_d000)?;

    let mut vcpus = Vec::with_capacity(spec.num_vcpus);
    for id in 0..spec.num_vcpus {
        vcpus.push(Some(vm_fd.create_vcpu(id as u64)?));
    }

    let cpuid = kvm.get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)?;

    Ok(Arc::new(KvmVm {
        vm_fd,
        ram,
        vcpus: Mutex::new(vcpus),
        gic: None,
        cpuid,
    }))
}

/// Program the long-mode entry state the boot loader prepared.
pub fn configure_vcpu(vcpu: &mut KvmVcpu, entry: &EntryState) -> Result<()> {
    let EntryState::X86 {
        rip,
        zero_page,
        page_table,
    } = *entry
    else {
        return Err(Error::Config("x86 vCPU got a non-x86 entry state".into()));
    };

    vcpu.fd.set_cpuid2(&vcpu.cpuid)?;

    let mut sregs = vcpu.fd.get_sregs()?;
    sregs.cs.base = 0;
    sregs.cs.limit = 0xffff_ffff;
    sregs.cs.selector = seg::CODE_SELECTOR;
    sregs.cs.type_ = seg::CODE_TYPE;
    sregs.cs.present = 1;
    sregs.cs.dpl = 0;
    sregs.cs.db = 0;
    sregs.cs.s = 1;
    sregs.cs.l = 1; // long mode
    sregs.cs.g = 1;

    sregs.ds.base = 0;
    sregs.ds.limit = 0xffff_ffff;
    sregs.ds.selector = seg::DATA_SELECTOR;
    sregs.ds.type_ = seg::DATA_TYPE;
    sregs.ds.present = 1;
    sregs.ds.dpl = 0;
    sregs.ds.db = 1;
    sregs.ds.s = 1;
    sregs.ds.l = 0;
    sregs.ds.g = 1;
    sregs.es = sregs.ds;
    sregs.fs = sregs.ds;
    sregs.gs = sregs.ds;
    sregs.ss = sregs.ds;

    sregs.cr0 = seg::CR0_PE | seg::CR0_PG;
    sregs.cr3 = page_table;
    sregs.cr4 = seg::CR4_PAE;
    sregs.efer = seg::EFER_LME | seg::EFER_LMA;
    vcpu.fd.set_sregs(&sregs)?;

    let regs = kvm_regs {
        rip,
        rsi: zero_page,
        rsp: 0,
        rflags: 0x2,
        ..Default::default()
    };
    vcpu.fd.set_regs(&regs)?;
    debug!(
        id = vcpu.id,
        rip = format_args!("{rip:#x}"),
        "configured 64-bit entry"
    );
    Ok(())
}

fn pick(regs: &kvm_regs, tag: Reg) -> Option<u64> {
    Some(match tag {
        Reg::Rax => regs.rax,
        Reg::Rbx => regs.rbx,
        Reg::Rcx => regs.rcx,
        Reg::Rdx => regs.rdx,
        Reg::Rsi => regs.rsi,
        Reg::Rdi => regs.rdi,
        Reg::Rsp => regs.rsp,
        Reg::Rbp => regs.rbp,
        Reg::R8 => regs.r8,
        Reg::R9 => regs.r9,
        Reg::R10 => regs.r10,
        Reg::R11 => regs.r11,
        Reg::R12 => regs.r12,
        Reg::R13 => regs.r13,
        Reg::R14 => regs.r14,
        Reg::R15 => regs.r15,
        Reg::Rip => regs.rip,
        Reg::Rflags => regs.rflags,
        _ => return None,
    })
}

fn poke(regs: &mut kvm_regs, tag: Reg, value: u64) -> bool {
    match tag {
        Reg::Rax => regs.rax = value,
        Reg::Rbx => regs.rbx = value,
        Reg::Rcx => regs.rcx = value,
        Reg::Rdx => regs.rdx = value,
        Reg::Rsi => regs.rsi = value,
        Reg::Rdi => regs.rdi = value,
        Reg::Rsp => regs.rsp = value,
        Reg::Rbp => regs.rbp = value,
        Reg::R8 => regs.r8 = value,
        Reg::R9 => regs.r9 = value,
        Reg::R10 => regs.r10 = value,
        Reg::R11 => regs.r11 = value,
        Reg::R12 => regs.r12 = value,
        Reg::R13 => regs.r13 = value,
        Reg::R14 => regs.r14 = value,
        Reg::R15 => regs.r15 = value,
        Reg::Rip => regs.rip = value,
        Reg::Rflags => regs.rflags = value,
        _ => return false,
    }
    true
}

pub fn get_regs(vcpu: &KvmVcpu, tags: &[Reg]) -> Result<RegMap> {
    let regs = vcpu.fd.get_regs()?;
    let mut map = RegMap::new();
    for &tag in tags {
        if let Some(v) = pick(&regs, tag) {
            map.insert(tag, v);
        }
    }
    Ok(map)
}

pub fn set_regs(vcpu: &KvmVcpu, update: &RegMap) -> Result<()> {
    let mut regs = vcpu.fd.get_regs()?;
    for (&tag, &value) in update {
        if !poke(&mut regs, tag, value) {
            return Err(Error::Config(format!("{tag:?} is not an x86 register")));
        }
    }
    vcpu.fd.set_regs(&regs)?;
    Ok(())
}
