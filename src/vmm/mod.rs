//! Machine assembly and the per-vCPU run loop
//!
//! [`Machine`] glues the pieces together: it opens the accelerator, builds
//! the platform device set for the host architecture, runs the boot
//! pipeline, then drives one OS thread per vCPU plus a shared poll thread
//! until the guest halts, asks for a reboot, or the caller cancels.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::MachineConfig;
use crate::devices::bus::DeviceBus;
use crate::devices::ioapic::IoApic;
use crate::devices::SystemSignals;
use crate::fs::FsBackend;
use crate::guest::InitConfig;
use crate::hv::{self, EntryState, VcpuExit, VirtualMachine, VmSpec};
use crate::net::NetBackend;
use crate::{Error, Result, RunOutcome};

/// Per-architecture memory plan.
mod layout {
    /// x86: RAM at zero, virtio windows in the PCI hole.
    pub const X86_RAM_BASE: u64 = 0;
    pub const X86_VIRTIO_BASE: u64 = 0xd000_0000;
    /// First IOAPIC pin handed to virtio devices.
    pub const X86_VIRTIO_GSI_BASE: u32 = 16;

    /// ARM64: RAM high, device windows between the GIC and RAM.
    pub const ARM64_RAM_BASE: u64 = 0x8000_0000;
    pub const ARM64_UART_BASE: u64 = 0x0900_0000;
    pub const ARM64_VIRTIO_BASE: u64 = 0x0a00_0000;
    /// First SPI (relative to INTID 32) for virtio devices; the UART has 1.
    pub const ARM64_UART_SPI: u32 = 1;
    pub const ARM64_VIRTIO_SPI_BASE: u32 = 16;
}

/// Cooperative cancellation: a flag plus a kick that interrupts blocked
/// `KVM_RUN` calls via a no-op signal.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    threads: Arc<Mutex<Vec<libc::pthread_t>>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            threads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Trip the token and kick every registered vCPU thread out of the
    /// guest promptly.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        for &thread in self.threads.lock().unwrap().iter() {
            // SAFETY: the ids were registered by live run-loop threads; a
            // stale id after join is benign (ESRCH).
            unsafe {
                libc::pthread_kill(thread, kick_signal());
            }
        }
    }

    fn register_current(&self) {
        // SAFETY: pthread_self is always valid for the calling thread.
        let id = unsafe { libc::pthread_self() };
        self.threads.lock().unwrap().push(id);
    }
}

fn kick_signal() -> i32 {
    libc::SIGUSR1
}

/// Install the no-op handler whose only job is making KVM_RUN return EINTR.
fn install_kick_handler() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        extern "C" fn noop(_: libc::c_int) {}
        // SAFETY: installing a no-op handler without SA_RESTART; the struct
        // is zero-initialized and every field we rely on is set explicitly.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = noop as usize;
            action.sa_flags = 0;
            libc::sigaction(kick_signal(), &action, std::ptr::null_mut());
        }
    });
}

/// Host-side console plumbing shared by the UART and virtio-console.
pub struct ConsoleEndpoints {
    pub output: Box<dyn Write + Send>,
    pub input: Arc<Mutex<VecDeque<u8>>>,
}

impl Default for ConsoleEndpoints {
    fn default() -> Self {
        Self {
            output: Box::new(std::io::stdout()),
            input: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

/// An assembled, bootable guest.
pub struct Machine {
    vm: Arc<dyn VirtualMachine>,
    bus: Arc<DeviceBus>,
    ioapic: Option<Arc<Mutex<IoApic>>>,
    signals: Arc<SystemSignals>,
    entry: EntryState,
    cancel: CancelToken,
}

impl Machine {
    /// Build a machine: devices registered, kernel and initramfs loaded,
    /// entry state computed. `fs` supplies the container root over
    /// virtio-fs; `net` enables virtio-net when present.
    pub fn new(
        config: &MachineConfig,
        fs: Box<dyn FsBackend>,
        net: Option<Box<dyn NetBackend>>,
        console: ConsoleEndpoints,
    ) -> Result<Self> {
        config.validate()?;
        let hypervisor = hv::open()?;
        info!(backend = hypervisor.name(), "opened hypervisor");

        let ram_base = if cfg!(target_arch = "aarch64") {
            layout::ARM64_RAM_BASE
        } else {
            layout::X86_RAM_BASE
        };
        let vm = hypervisor.create_vm(&VmSpec {
            num_vcpus: config.vcpus,
            mem_base: ram_base,
            mem_size: (config.memory_mb as u64) * 1024 * 1024,
        })?;

        let kernel = std::fs::read(&config.kernel)
            .map_err(|e| Error::Config(format!("cannot read kernel image: {e}")))?;
        let init_cfg = InitConfig {
            fs_tag: config.fs_tag.clone(),
            hostname: config.hostname.clone(),
            working_dir: config.working_dir.clone(),
            argv: config.argv.clone(),
            env: config.env.clone(),
            network: config.network.clone(),
            pid1: config.pid1,
        };

        let signals = SystemSignals::new();
        let mut bus = DeviceBus::new();

        #[cfg(target_arch = "x86_64")]
        let (entry, ioapic) = {
            let target = crate::codegen::Target::X86_64;
            let initramfs = crate::boot::build_initramfs(&init_cfg, target, config.mem_node)?;
            build_x86_machine(
                &vm, &mut bus, &signals, config, fs, net, console, &kernel, &initramfs,
            )?
        };
        #[cfg(target_arch = "aarch64")]
        let (entry, ioapic) = {
            let target = crate::codegen::Target::Aarch64;
            let initramfs = crate::boot::build_initramfs(&init_cfg, target, config.mem_node)?;
            build_arm64_machine(
                &vm, &mut bus, &signals, config, fs, net, console, &kernel, &initramfs,
            )?
        };
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        let (entry, ioapic): (EntryState, Option<Arc<Mutex<IoApic>>>) = {
            let _ = (fs, net, console, kernel, init_cfg);
            return Err(Error::HypervisorUnsupported);
        };

        Ok(Self {
            vm,
            bus: Arc::new(bus),
            ioapic,
            signals,
            entry,
            cancel: CancelToken::new(),
        })
    }

    /// The cancellation token; trip it (e.g. from a signal handler thread)
    /// to stop the guest.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Guest RAM, for callers that stage extra data.
    pub fn ram(&self) -> &crate::memory::GuestRam {
        self.vm.ram()
    }

    /// Run the guest to completion. Blocks; returns how the run ended.
    pub fn run(&mut self) -> Result<RunOutcome> {
        install_kick_handler();
        let done = Arc::new(AtomicBool::new(false));
        let fatal: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let outcome: Arc<Mutex<Option<RunOutcome>>> = Arc::new(Mutex::new(None));

        let mut threads = Vec::new();
        for id in 0..self.vm.num_vcpus() {
            let mut vcpu = self.vm.take_vcpu(id)?;
            if id == 0 {
                vcpu.configure(&self.entry)?;
            }
            let ctx = VcpuContext {
                bus: self.bus.clone(),
                ioapic: self.ioapic.clone(),
                signals: self.signals.clone(),
                cancel: self.cancel.clone(),
                ram: self.vm.ram().clone(),
            };
            let done_flag = done.clone();
            let fatal_slot = fatal.clone();
            let outcome_slot = outcome.clone();
            let handle = std::thread::Builder::new()
                .name(format!("vcpu-{id}"))
                .spawn(move || {
                    ctx.cancel.register_current();
                    let result = run_vcpu(&mut *vcpu, &ctx);
                    match result {
                        Ok(o) => {
                            let mut slot = outcome_slot.lock().unwrap();
                            if slot.is_none() {
                                *slot = Some(o);
                            }
                        }
                        Err(e) => {
                            let mut slot = fatal_slot.lock().unwrap();
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                        }
                    }
                    done_flag.store(true, Ordering::SeqCst);
                    ctx.cancel.cancel();
                })
                .map_err(|e| Error::Host(format!("cannot spawn vCPU thread: {e}")))?;
            threads.push(handle);
        }

        // Shared poll thread: keeps timers and host-side I/O moving while
        // vCPUs sit inside the guest.
        let poll_bus = self.bus.clone();
        let poll_done = done.clone();
        let poll_fatal = fatal.clone();
        let poll_cancel = self.cancel.clone();
        let poll_handle = std::thread::Builder::new()
            .name("device-poll".into())
            .spawn(move || {
                while !poll_done.load(Ordering::SeqCst) && !poll_cancel.is_cancelled() {
                    if let Err(e) = poll_bus.poll_all() {
                        let mut slot = poll_fatal.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        poll_cancel.cancel();
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
            .map_err(|e| Error::Host(format!("cannot spawn poll thread: {e}")))?;

        for handle in threads {
            let _ = handle.join();
        }
        done.store(true, Ordering::SeqCst);
        let _ = poll_handle.join();

        if let Some(e) = fatal.lock().unwrap().take() {
            return Err(e);
        }
        if self.cancel.is_cancelled() && outcome.lock().unwrap().is_none() {
            return Ok(RunOutcome::Cancelled);
        }
        let o = outcome
            .lock()
            .unwrap()
            .take()
            .unwrap_or(RunOutcome::Cancelled);
        info!(outcome = ?o, "guest stopped");
        Ok(o)
    }
}

struct VcpuContext {
    bus: Arc<DeviceBus>,
    ioapic: Option<Arc<Mutex<IoApic>>>,
    signals: Arc<SystemSignals>,
    cancel: CancelToken,
    ram: crate::memory::GuestRam,
}

fn run_vcpu(vcpu: &mut dyn hv::Vcpu, ctx: &VcpuContext) -> Result<RunOutcome> {
    debug!(id = vcpu.id(), "vCPU entering run loop");
    loop {
        if ctx.cancel.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }
        let step = (|| -> Result<Option<RunOutcome>> {
            match vcpu.run()? {
                VcpuExit::PortIn { port, data } => {
                    ctx.bus.port_io(port, data, false)?;
                }
                VcpuExit::PortOut { port, data } => {
                    // The bus API is symmetric; writes do not mutate `data`.
                    let mut buf = data.to_vec();
                    ctx.bus.port_io(port, &mut buf, true)?;
                }
                VcpuExit::MmioRead { gpa, data } => {
                    ctx.bus.mmio(gpa, data, false)?;
                }
                VcpuExit::MmioWrite { gpa, data } => {
                    let mut buf = data.to_vec();
                    ctx.bus.mmio(gpa, &mut buf, true)?;
                }
                VcpuExit::EoiBroadcast { vector } => {
                    if let Some(ioapic) = &ctx.ioapic {
                        ioapic.lock().unwrap().handle_eoi(vector);
                    }
                }
                VcpuExit::Halted => return Ok(Some(RunOutcome::Halted)),
                VcpuExit::RebootRequest => return Ok(Some(RunOutcome::RebootRequested)),
                VcpuExit::Interrupted => {}
            }
            Ok(None)
        })();
        match step {
            Ok(Some(outcome)) => return Ok(outcome),
            Ok(None) => {}
            Err(e) => {
                dump_fatal_state(vcpu, ctx, &e);
                return Err(e);
            }
        }
        if ctx.signals.reboot_requested() {
            return Ok(RunOutcome::RebootRequested);
        }
        // Poll hooks also run between exits on the vCPU's own thread.
        ctx.bus.poll_all()?;
    }
}

/// Capture registers and a code-window hex dump for the failure report.
fn dump_fatal_state(vcpu: &mut dyn hv::Vcpu, ctx: &VcpuContext, cause: &Error) {
    error!(id = vcpu.id(), error = %cause, "fatal vCPU exit");
    let Ok(regs) = vcpu.get_regs(&hv::general_regs()) else {
        error!("register state unavailable");
        return;
    };
    for (tag, value) in &regs {
        error!("  {tag:?} = {value:#018x}");
    }
    // Recent device traffic, oldest first.
    for ev in ctx.bus.recent_trace() {
        error!(
            "  trace: {} {} {:#x} len={} value={:#x}",
            if ev.is_port { "pio" } else { "mmio" },
            if ev.is_write { "write" } else { "read" },
            ev.addr,
            ev.len,
            ev.value
        );
    }
    let pc = regs.get(&hv::pc_reg()).copied().unwrap_or(0);
    // 128 bytes of code around the fault, hex + ASCII.
    let mut code = [0u8; 128];
    if ctx.ram.read_at(pc, &mut code).is_ok() {
        for (i, chunk) in code.chunks(16).enumerate() {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
            let ascii: String = chunk
                .iter()
                .map(|&b| {
                    if (0x20..0x7f).contains(&b) {
                        b as char
                    } else {
                        '.'
                    }
                })
                .collect();
            error!(
                "  {:#010x}: {} |{}|",
                pc + (i as u64) * 16,
                hex.join(" "),
                ascii
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Architecture-specific machine assembly
// ---------------------------------------------------------------------------

#[cfg(target_arch = "x86_64")]
#[allow(clippy::too_many_arguments)]
fn build_x86_machine(
    vm: &Arc<dyn VirtualMachine>,
    bus: &mut DeviceBus,
    signals: &Arc<SystemSignals>,
    config: &MachineConfig,
    fs: Box<dyn FsBackend>,
    net: Option<Box<dyn NetBackend>>,
    console: ConsoleEndpoints,
    kernel: &[u8],
    initramfs: &[u8],
) -> Result<(EntryState, Option<Arc<Mutex<IoApic>>>)> {
    use crate::boot::acpi::{self, VirtioMmioDesc};
    use crate::devices::ioapic::IoApicLine;
    use crate::devices::virtio::console::VirtioConsole;
    use crate::devices::virtio::fs::VirtioFs;
    use crate::devices::virtio::net::VirtioNet;
    use crate::devices::virtio::{VirtioMmio, MMIO_WINDOW};
    use crate::devices::pic::{DualPic, PicLine};
    use crate::devices::{
        cmos::Cmos, hpet, kbc, pit::Pit, Device, FanoutLine, InterruptLine, SinkLine,
    };

    let ram = vm.ram().clone();
    let msi_sink = hv::VmMsiSink::new(vm.clone());
    let ioapic = Arc::new(Mutex::new(IoApic::new(msi_sink)));

    let line = |pin: u32| -> Arc<dyn InterruptLine> { IoApicLine::new(ioapic.clone(), pin as usize) };

    // Legacy chipset.
    let uart = crate::devices::serial::Uart16550::new(
        0x3f8,
        line(4),
        console.output,
        console.input.clone(),
    );
    bus.claim_line(4, "uart16550")?;
    bus.add(Arc::new(Mutex::new(uart)))?;

    // The 8259 pair is probed by the kernel; delivery runs through the
    // IOAPIC, so its aggregated output terminates in a sink.
    let pic = Arc::new(Mutex::new(DualPic::new(Arc::new(SinkLine))));
    bus.add(pic.clone() as Arc<Mutex<dyn Device>>)?;

    // Legacy IRQ0 feeds both the PIC input and its IOAPIC pin (GSI 2 per
    // the MADT override).
    bus.claim_line(2, "i8254")?;
    let irq0_taps: Vec<Arc<dyn InterruptLine>> = vec![PicLine::new(pic.clone(), 0), line(2)];
    bus.add(Arc::new(Mutex::new(Pit::new(FanoutLine::new(irq0_taps)))))?;
    bus.add(Arc::new(Mutex::new(kbc::I8042::new(signals.clone()))))?;
    bus.add(Arc::new(Mutex::new(kbc::ResetPort::new(signals.clone()))))?;
    bus.claim_line(8, "cmos-rtc")?;
    let irq8_taps: Vec<Arc<dyn InterruptLine>> = vec![PicLine::new(pic.clone(), 8), line(8)];
    bus.add(Arc::new(Mutex::new(Cmos::new(FanoutLine::new(irq8_taps), ram.size()))))?;

    let hpet_lines: Vec<Arc<dyn InterruptLine>> = (0..hpet::NUM_TIMERS)
        .map(|i| {
            let gsi = hpet::ROUTE_BASE + i as u32;
            bus.claim_line(gsi, "hpet")?;
            Ok(line(gsi))
        })
        .collect::<Result<_>>()?;
    bus.add(Arc::new(Mutex::new(hpet::Hpet::new(hpet_lines))))?;

    // Virtio transports: fs always, console always, net when configured.
    let mut descs = Vec::new();
    let mut next_slot = 0u64;
    let mut add_virtio = |bus: &mut DeviceBus,
                          backend: Box<dyn crate::devices::virtio::VirtioBackend>|
     -> Result<()> {
        let base = layout::X86_VIRTIO_BASE + next_slot * 0x1000;
        let gsi = layout::X86_VIRTIO_GSI_BASE + next_slot as u32;
        next_slot += 1;
        bus.claim_line(gsi, "virtio-mmio")?;
        let dev = VirtioMmio::new(base, line(gsi), ram.clone(), backend);
        bus.add(Arc::new(Mutex::new(dev)))?;
        descs.push(VirtioMmioDesc {
            base,
            size: MMIO_WINDOW as u32,
            gsi,
        });
        Ok(())
    };

    add_virtio(bus, Box::new(VirtioFs::new(config.fs_tag.clone(), fs)))?;
    add_virtio(
        bus,
        Box::new(VirtioConsole::new(
            Box::new(std::io::sink()),
            console.input.clone(),
        )),
    )?;
    if let Some(net_backend) = net {
        add_virtio(bus, Box::new(VirtioNet::new(net_backend)))?;
    }

    // The IOAPIC itself is an MMIO device on the bus.
    bus.add(ioapic.clone() as Arc<Mutex<dyn Device>>)?;

    // Boot pipeline.
    let acpi_info = acpi::install(&ram, config.vcpus as u32, &descs)?;
    let boot = crate::boot::x86::load_kernel(
        &ram,
        kernel,
        &config.kernel_cmdline(),
        initramfs,
        &acpi_info,
    )?;

    Ok((
        EntryState::X86 {
            rip: boot.entry_rip,
            zero_page: boot.zero_page,
            page_table: boot.page_table,
        },
        Some(ioapic),
    ))
}

#[cfg(target_arch = "aarch64")]
#[allow(clippy::too_many_arguments)]
fn build_arm64_machine(
    vm: &Arc<dyn VirtualMachine>,
    bus: &mut DeviceBus,
    signals: &Arc<SystemSignals>,
    config: &MachineConfig,
    fs: Box<dyn FsBackend>,
    net: Option<Box<dyn NetBackend>>,
    console: ConsoleEndpoints,
    kernel: &[u8],
    initramfs: &[u8],
) -> Result<(EntryState, Option<Arc<Mutex<IoApic>>>)> {
    use crate::devices::virtio::console::VirtioConsole;
    use crate::devices::virtio::fs::VirtioFs;
    use crate::devices::virtio::net::VirtioNet;
    use crate::devices::virtio::{VirtioMmio, MMIO_WINDOW};
    use crate::devices::InterruptLine;
    use crate::hv::VmSpiLine;

    let _ = signals;
    let ram = vm.ram().clone();
    let gic = vm
        .gic_layout()
        .ok_or_else(|| Error::Config("ARM64 backend reports no GIC".into()))?;

    let spi_line = |spi: u32| -> Arc<dyn InterruptLine> { VmSpiLine::new(vm.clone(), 32 + spi) };

    let uart = crate::devices::serial::Uart16550::new(
        0x3f8,
        spi_line(layout::ARM64_UART_SPI),
        console.output,
        console.input.clone(),
    )
    .with_mmio(layout::ARM64_UART_BASE);
    bus.claim_line(layout::ARM64_UART_SPI, "uart16550")?;
    bus.add(Arc::new(Mutex::new(uart)))?;

    let mut virtio_nodes = Vec::new();
    let mut next_slot = 0u64;
    let mut add_virtio = |bus: &mut DeviceBus,
                          backend: Box<dyn crate::devices::virtio::VirtioBackend>|
     -> Result<()> {
        let base = layout::ARM64_VIRTIO_BASE + next_slot * 0x1000;
        let spi = layout::ARM64_VIRTIO_SPI_BASE + next_slot as u32;
        next_slot += 1;
        bus.claim_line(spi, "virtio-mmio")?;
        let dev = VirtioMmio::new(base, spi_line(spi), ram.clone(), backend);
        bus.add(Arc::new(Mutex::new(dev)))?;
        virtio_nodes.push((base, MMIO_WINDOW, spi));
        Ok(())
    };

    add_virtio(bus, Box::new(VirtioFs::new(config.fs_tag.clone(), fs)))?;
    add_virtio(
        bus,
        Box::new(VirtioConsole::new(
            Box::new(std::io::sink()),
            console.input.clone(),
        )),
    )?;
    if let Some(net_backend) = net {
        add_virtio(bus, Box::new(VirtioNet::new(net_backend)))?;
    }

    let boot = crate::boot::arm64::load_kernel(&ram, kernel, initramfs)?;
    let fdt = crate::boot::fdt::build(&crate::boot::fdt::FdtConfig {
        cmdline: config.kernel_cmdline(),
        num_cpus: config.vcpus as u32,
        ram_base: ram.base(),
        ram_size: ram.size(),
        initrd: Some((boot.initramfs_start, boot.initramfs_end)),
        gic,
        uart_base: layout::ARM64_UART_BASE,
        uart_spi: layout::ARM64_UART_SPI,
        virtio: virtio_nodes,
    })?;
    if boot.fdt_addr + fdt.len() as u64 > ram.end() {
        return Err(Error::Config("FDT does not fit in guest RAM".into()));
    }
    ram.write_at(boot.fdt_addr, &fdt)?;

    Ok((
        EntryState::Arm64 {
            pc: boot.entry_pc,
            fdt: boot.fdt_addr,
        },
        None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_flags() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_kick_interrupts_a_blocked_thread() {
        install_kick_handler();
        let token = CancelToken::new();
        let t2 = token.clone();
        let handle = std::thread::spawn(move || {
            t2.register_current();
            while !t2.is_cancelled() {
                // A long nanosleep the kick must interrupt.
                let req = libc::timespec {
                    tv_sec: 3600,
                    tv_nsec: 0,
                };
                // SAFETY: plain nanosleep with a valid timespec.
                unsafe {
                    libc::nanosleep(&req, std::ptr::null_mut());
                }
            }
        });
        std::thread::sleep(Duration::from_millis(20));
        let start = std::time::Instant::now();
        token.cancel();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_millis(250));
    }
}
