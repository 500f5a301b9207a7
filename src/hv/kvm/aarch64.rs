//! KVM ARM64 specifics: in-kernel vGICv3, EL1 entry, core register access

use std::sync::{Arc, Mutex};

use kvm_bindings::{
    kvm_device_attr, kvm_regs, kvm_vcpu_init, KVM_ARM_VCPU_POWER_OFF, KVM_ARM_VCPU_PSCI_0_2,
    KVM_DEV_TYPE_ARM_VGIC_V3,
};
use kvm_ioctls::{DeviceFd, Kvm, VmFd};
use tracing::debug;

use super::{KvmVcpu, KvmVm};
use crate::hv::{EntryState, GicLayout, Reg, RegMap, VmSpec};
use crate::memory::GuestRam;
use crate::{Error, Result};

/// Default GIC frame placement, matching the FDT the boot pipeline emits.
pub const GIC_DIST_BASE: u64 = 0x0800_0000;
pub const GIC_DIST_SIZE: u64 = 0x1_0000;
pub const GIC_REDIST_BASE: u64 = 0x080a_0000;
pub const GIC_REDIST_STRIDE: u64 = 0x2_0000;
pub const GIC_MAINTENANCE_IRQ: u32 = 9;

/// EL1h with DAIF masked.
const PSTATE_EL1H_DAIF: u64 = 0x3c5;

/// vGIC device attribute groups (uapi kvm.h).
const KVM_DEV_ARM_VGIC_GRP_ADDR: u32 = 0;
const KVM_DEV_ARM_VGIC_GRP_CTRL: u32 = 4;
const KVM_VGIC_V3_ADDR_TYPE_DIST: u64 = 2;
const KVM_VGIC_V3_ADDR_TYPE_REDIST: u64 = 3;
const KVM_DEV_ARM_VGIC_CTRL_INIT: u64 = 0;

/// Core register id for a u64 field at `offset` bytes into `kvm_regs`.
fn core_reg_id(offset: usize) -> u64 {
    const KVM_REG_ARM64: u64 = 0x6000_0000_0000_0000;
    const KVM_REG_SIZE_U64: u64 = 0x0030_0000_0000_0000;
    const KVM_REG_ARM_CORE: u64 = 0x0010 << 16;
    KVM_REG_ARM64 | KVM_REG_SIZE_U64 | KVM_REG_ARM_CORE | (offset as u64 / 4)
}

fn reg_offset(tag: Reg) -> Result<usize> {
    let user_pt_base = std::mem::offset_of!(kvm_regs, regs);
    Ok(match tag {
        Reg::X(n) if n < 31 => user_pt_base + (n as usize) * 8,
        Reg::Sp => user_pt_base + 31 * 8,
        Reg::Pc => user_pt_base + 32 * 8,
        Reg::Pstate => user_pt_base + 33 * 8,
        other => {
            return Err(Error::Config(format!(
                "{other:?} is not an ARM64 register"
            )))
        }
    })
}

fn set_device_attr(dev: &DeviceFd, group: u32, attr: u64, value: Option<&u64>) -> Result<()> {
    let raw = kvm_device_attr {
        group,
        attr,
        addr: value.map(|v| v as *const u64 as u64).unwrap_or(0),
        flags: 0,
    };
    dev.set_device_attr(&raw)?;
    Ok(())
}

/// Finish VM construction: vCPUs first (the vGIC wants them all), then the
/// in-kernel GICv3.
pub fn finish_vm(kvm: &Kvm, vm_fd: VmFd, ram: GuestRam, spec: &VmSpec) -> Result<Arc<KvmVm>> {
    let mut init = kvm_vcpu_init::default();
    vm_fd.get_preferred_target(&mut init)?;
    init.features[0] |= 1 << KVM_ARM_VCPU_PSCI_0_2;

    let mut vcpus = Vec::with_capacity(spec.num_vcpus);
    for id in 0..spec.num_vcpus {
        let fd = vm_fd.create_vcpu(id as u64)?;
        let mut vcpu_init = init;
        if id > 0 {
            // Secondary CPUs wait for PSCI CPU_ON.
            vcpu_init.features[0] |= 1 << KVM_ARM_VCPU_POWER_OFF;
        }
        fd.vcpu_init(&vcpu_init)?;
        vcpus.push(Some(fd));
    }

    let mut gic_device = kvm_bindings::kvm_create_device {
        type_: KVM_DEV_TYPE_ARM_VGIC_V3,
        fd: 0,
        flags: 0,
    };
    let gic_fd = vm_fd.create_device(&mut gic_device)?;

    let dist = GIC_DIST_BASE;
    set_device_attr(
        &gic_fd,
        KVM_DEV_ARM_VGIC_GRP_ADDR,
        KVM_VGIC_V3_ADDR_TYPE_DIST,
        Some(&dist),
    )?;
    let redist = GIC_REDIST_BASE;
    set_device_attr(
        &gic_fd,
        KVM_DEV_ARM_VGIC_GRP_ADDR,
        KVM_VGIC_V3_ADDR_TYPE_REDIST,
        Some(&redist),
    )?;
    set_device_attr(
        &gic_fd,
        KVM_DEV_ARM_VGIC_GRP_CTRL,
        KVM_DEV_ARM_VGIC_CTRL_INIT,
        None,
    )?;
    debug!(
        dist = format_args!("{GIC_DIST_BASE:#x}"),
        redist = format_args!("{GIC_REDIST_BASE:#x}"),
        "initialized in-kernel vGICv3"
    );
    // KVM pins the vGIC to the VM; the device fd itself is no longer needed.
    std::mem::forget(gic_fd);

    Ok(Arc::new(KvmVm {
        vm_fd,
        ram,
        vcpus: Mutex::new(vcpus),
        gic: Some(GicLayout {
            dist_base: GIC_DIST_BASE,
            dist_size: GIC_DIST_SIZE,
            redist_base: GIC_REDIST_BASE,
            redist_size: GIC_REDIST_STRIDE * spec.num_vcpus as u64,
            maintenance_irq: GIC_MAINTENANCE_IRQ,
        }),
    }))
}

/// Program the EL1 entry state the boot pipeline prepared.
pub fn configure_vcpu(vcpu: &mut KvmVcpu, entry: &EntryState) -> Result<()> {
    let EntryState::Arm64 { pc, fdt } = *entry else {
        return Err(Error::Config("ARM64 vCPU got a non-ARM64 entry state".into()));
    };
    vcpu.fd.set_one_reg(core_reg_id(reg_offset(Reg::Pc)?), &pc.to_le_bytes())?;
    vcpu.fd
        .set_one_reg(core_reg_id(reg_offset(Reg::X(0))?), &fdt.to_le_bytes())?;
    for n in 1..4 {
        vcpu.fd
            .set_one_reg(core_reg_id(reg_offset(Reg::X(n))?), &0u64.to_le_bytes())?;
    }
    vcpu.fd.set_one_reg(
        core_reg_id(reg_offset(Reg::Pstate)?),
        &PSTATE_EL1H_DAIF.to_le_bytes(),
    )?;
    debug!(id = vcpu.id, pc = format_args!("{pc:#x}"), "configured EL1 entry");
    Ok(())
}

pub fn get_regs(vcpu: &KvmVcpu, tags: &[Reg]) -> Result<RegMap> {
    let mut map = RegMap::new();
    for &tag in tags {
        let mut bytes = [0u8; 8];
        vcpu.fd
            .get_one_reg(core_reg_id(reg_offset(tag)?), &mut bytes)?;
        map.insert(tag, u64::from_le_bytes(bytes));
    }
    Ok(map)
}

pub fn set_regs(vcpu: &KvmVcpu, update: &RegMap) -> Result<()> {
    for (&tag, &value) in update {
        vcpu.fd
            .set_one_reg(core_reg_id(reg_offset(tag)?), &value.to_le_bytes())?;
    }
    Ok(())
}
