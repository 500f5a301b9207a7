//! cc: run a command inside a hardware-accelerated micro-VM
//!
//! The image-pulling front end lives elsewhere; this binary takes an
//! unpacked container root directory, a kernel, and an argv, and exits with
//! the guest's outcome.

use std::collections::VecDeque;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use cc_vmm::fs::PassthroughFs;
use cc_vmm::net::LoopbackNet;
use cc_vmm::vmm::ConsoleEndpoints;
use cc_vmm::{Machine, MachineConfig, NetworkConfig, RunOutcome};

#[derive(Parser, Debug)]
#[command(name = "cc", about = "Run a command in a micro-VM", version)]
struct Args {
    /// Kernel image (bzImage/vmlinux on x86, Image on ARM64)
    #[arg(long, env = "CC_KERNEL")]
    kernel: PathBuf,

    /// Unpacked container root directory served over virtio-fs
    #[arg(long)]
    rootfs: PathBuf,

    /// Guest RAM in MiB
    #[arg(long, default_value_t = 256)]
    memory: usize,

    /// Number of vCPUs
    #[arg(long, default_value_t = 1)]
    cpus: usize,

    /// Working directory inside the container
    #[arg(long, default_value = "/")]
    workdir: String,

    /// KEY=VALUE environment entries for the container process
    #[arg(long = "env", short = 'e')]
    env: Vec<String>,

    /// Enable the static guest network (10.42.0.2/24)
    #[arg(long)]
    net: bool,

    /// Run the command as PID 1 instead of under the init reaper
    #[arg(long)]
    pid1: bool,

    /// Extra kernel command line text
    #[arg(long)]
    cmdline: Option<String>,

    /// Command and arguments to run in the guest
    #[arg(required = true, trailing_var_arg = true)]
    argv: Vec<String>,
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(RunOutcome::Halted) | Ok(RunOutcome::RebootRequested) => std::process::ExitCode::SUCCESS,
        Ok(RunOutcome::Cancelled) => {
            eprintln!("cc: cancelled");
            std::process::ExitCode::from(130)
        }
        Err(e) => {
            eprintln!("cc: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> cc_vmm::Result<RunOutcome> {
    let mut env = args.env.clone();
    if !env.iter().any(|kv| kv.starts_with("PATH=")) {
        env.push("PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into());
    }

    let mut config = MachineConfig::default()
        .kernel(args.kernel)
        .memory_mb(args.memory)
        .vcpus(args.cpus)
        .argv(args.argv);
    config.working_dir = args.workdir;
    config.env = env;
    config.extra_cmdline = args.cmdline;
    config.pid1 = args.pid1;
    if args.net {
        config.network = Some(NetworkConfig::default());
    }

    let fs = Box::new(PassthroughFs::new(&args.rootfs));
    let net = args.net.then(|| Box::new(LoopbackNet::new()) as Box<dyn cc_vmm::net::NetBackend>);

    let input: Arc<Mutex<VecDeque<u8>>> = Arc::new(Mutex::new(VecDeque::new()));
    let console = ConsoleEndpoints {
        output: Box::new(std::io::stdout()),
        input: input.clone(),
    };

    let mut machine = Machine::new(&config, fs, net, console)?;

    // Cancellation on SIGINT/SIGHUP/SIGTERM: every vCPU thread returns
    // promptly and the process exits with the cancelled code.
    let cancel = machine.cancel_token();
    install_cancel_handler(cancel.clone());

    // Detached stdin drain: bytes flow to the UART through the shared queue.
    std::thread::Builder::new()
        .name("stdin-drain".into())
        .spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 256];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => input.lock().unwrap().extend(&buf[..n]),
                }
            }
            debug!("stdin closed");
        })
        .ok();

    machine.run()
}

fn install_cancel_handler(cancel: cc_vmm::vmm::CancelToken) {
    use std::sync::atomic::{AtomicBool, Ordering};

    // The handler itself only flips a flag; a watcher thread does the
    // non-signal-safe work of kicking the vCPU threads.
    static REQUESTED: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_signal(_: libc::c_int) {
        REQUESTED.store(true, Ordering::SeqCst);
    }
    // SAFETY: handler installation for standard termination signals; the
    // handler only stores to a static atomic.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_signal as usize;
        for sig in [libc::SIGINT, libc::SIGHUP, libc::SIGTERM] {
            libc::sigaction(sig, &action, std::ptr::null_mut());
        }
    }

    std::thread::Builder::new()
        .name("cancel-watch".into())
        .spawn(move || loop {
            if REQUESTED.load(Ordering::SeqCst) {
                cancel.cancel();
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        })
        .ok();
}
