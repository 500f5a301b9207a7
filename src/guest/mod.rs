//! Guest init program
//!
//! Builds the IR program that becomes `/init` in the initramfs: mount the
//! virtio-fs root, pivot into it, wire up the pseudo-filesystems and
//! optional static networking, then exec the container command. A fatal
//! label prints the errno and reboots the guest.

use std::collections::BTreeMap;

use crate::codegen::{
    compile, Cond, Fragment, Global, Method, PrintfPart, Program, Target, Value, Width,
};
use crate::config::NetworkConfig;
use crate::Result;

/// Everything the init program needs to know about one guest.
#[derive(Debug, Clone)]
pub struct InitConfig {
    pub fs_tag: String,
    pub hostname: String,
    pub working_dir: String,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub network: Option<NetworkConfig>,
    pub pid1: bool,
}

/// Per-target syscall numbers used by the init program.
struct SysNr {
    openat: i64,
    close: i64,
    execve: i64,
    wait4: i64,
    clone: i64,
    mkdirat: i64,
    chdir: i64,
    mount: i64,
    umount2: i64,
    pivot_root: i64,
    chroot: i64,
    sethostname: i64,
    reboot: i64,
    unlinkat: i64,
    socket: i64,
    ioctl: i64,
    write: i64,
    exit: i64,
}

impl SysNr {
    fn for_target(target: Target) -> Self {
        match target {
            Target::X86_64 => SysNr {
                openat: 257,
                close: 3,
                execve: 59,
                wait4: 61,
                clone: 56,
                mkdirat: 258,
                chdir: 80,
                mount: 165,
                umount2: 166,
                pivot_root: 155,
                chroot: 161,
                sethostname: 170,
                reboot: 169,
                unlinkat: 263,
                socket: 41,
                ioctl: 16,
                write: 1,
                exit: 60,
            },
            Target::Aarch64 => SysNr {
                openat: 56,
                close: 57,
                execve: 221,
                wait4: 260,
                clone: 220,
                mkdirat: 34,
                chdir: 49,
                mount: 40,
                umount2: 39,
                pivot_root: 41,
                chroot: 51,
                sethostname: 161,
                reboot: 142,
                unlinkat: 35,
                socket: 198,
                ioctl: 29,
                write: 64,
                exit: 93,
            },
        }
    }

    /// reboot(2) command for the fatal path: restart on x86, power-off on
    /// ARM64 (PSCI turns it into a clean VM exit).
    fn fatal_reboot_cmd(target: Target) -> i64 {
        match target {
            Target::X86_64 => 0x0123_4567,          // LINUX_REBOOT_CMD_RESTART
            Target::Aarch64 => 0x4321_fedc_u32 as i64, // LINUX_REBOOT_CMD_POWER_OFF
        }
    }
}

const AT_FDCWD: i64 = -100;
const AT_REMOVEDIR: i64 = 0x200;
const MNT_DETACH: i64 = 2;
const REBOOT_MAGIC1: i64 = 0xfee1_dead_u32 as i64;
const REBOOT_MAGIC2: i64 = 0x2812_1969;

const SIOCSIFADDR: i64 = 0x8916;
const SIOCSIFNETMASK: i64 = 0x891c;
const SIOCSIFFLAGS: i64 = 0x8914;
const SIOCADDRT: i64 = 0x890b;
const IFF_UP_RUNNING: i64 = 0x41;
const AF_INET: i64 = 2;
const SOCK_DGRAM: i64 = 2;
const O_WRONLY_CREAT_TRUNC: i64 = 0x241;

struct Builder {
    target: Target,
    nr: SysNr,
    body: Vec<Fragment>,
    strings: BTreeMap<String, String>,
    globals: Vec<(String, Global)>,
    seq: usize,
}

impl Builder {
    fn new(target: Target) -> Self {
        Self {
            target,
            nr: SysNr::for_target(target),
            body: Vec::new(),
            strings: BTreeMap::new(),
            globals: Vec::new(),
            seq: 0,
        }
    }

    fn fresh_global(&mut self, stem: &str, size: u64, align: u64) -> String {
        self.seq += 1;
        let name = format!("{stem}_{}", self.seq);
        self.globals.push((name.clone(), Global { size, align }));
        name
    }

    /// The address of a NUL-terminated string, staged into BSS once.
    fn string(&mut self, text: &str) -> Value {
        if let Some(name) = self.strings.get(text) {
            return Value::Global(name.clone());
        }
        let name = self.fresh_global("str", text.len() as u64 + 1, 8);
        self.strings.insert(text.to_string(), name.clone());
        Value::Global(name)
    }

    /// Fragments that fill every staged string with its bytes.
    fn string_init_fragments(&self) -> Vec<Fragment> {
        let mut out = Vec::new();
        for (text, name) in &self.strings {
            let bytes = text.as_bytes();
            let mut off = 0usize;
            while off < bytes.len() {
                let mut chunk = [0u8; 8];
                let n = (bytes.len() - off).min(8);
                chunk[..n].copy_from_slice(&bytes[off..off + n]);
                out.push(Fragment::StoreMem {
                    base: Value::Global(name.clone()),
                    disp: off as i32,
                    value: Value::Int(i64::from_le_bytes(chunk)),
                    width: Width::Quad,
                });
                off += 8;
            }
        }
        out
    }

    fn syscall(&mut self, nr: i64, args: Vec<Value>) {
        self.body.push(Fragment::Syscall {
            nr,
            args,
            result: Some("ret".into()),
        });
    }

    /// Syscall whose failure is fatal.
    fn syscall_checked(&mut self, nr: i64, args: Vec<Value>) {
        self.syscall(nr, args);
        self.body.push(Fragment::If {
            cond: Cond::IsNegative(Value::var("ret")),
            then_block: vec![Fragment::Goto("fail".into())],
            else_block: vec![],
        });
    }

    fn mkdir(&mut self, path: &str) {
        let p = self.string(path);
        // Exists-already is fine; no check.
        self.syscall(self.nr.mkdirat, vec![Value::Int(AT_FDCWD), p, Value::Int(0o755)]);
    }

    fn mount(&mut self, source: &str, target_path: &str, fstype: &str, data: Option<&str>) {
        let s = self.string(source);
        let t = self.string(target_path);
        let f = self.string(fstype);
        let d = match data {
            Some(d) => self.string(d),
            None => Value::Int(0),
        };
        self.syscall_checked(self.nr.mount, vec![s, t, f, Value::Int(0), d]);
    }

    fn chdir(&mut self, path: &str) {
        let p = self.string(path);
        self.syscall_checked(self.nr.chdir, vec![p]);
    }

    /// Build a pointer array global from string values; NULL-terminated.
    fn pointer_vec(&mut self, items: &[String]) -> Value {
        let name = self.fresh_global("vec", (items.len() as u64 + 1) * 8, 8);
        for (i, item) in items.iter().enumerate() {
            let v = self.string(item);
            self.body.push(Fragment::StoreMem {
                base: Value::Global(name.clone()),
                disp: (i * 8) as i32,
                value: v,
                width: Width::Quad,
            });
        }
        self.body.push(Fragment::StoreMem {
            base: Value::Global(name.clone()),
            disp: (items.len() * 8) as i32,
            value: Value::Int(0),
            width: Width::Quad,
        });
        Value::Global(name)
    }

    /// Write a 16-byte sockaddr_in into `global` at `disp`.
    fn store_sockaddr_in(&mut self, global: &str, disp: i32, addr_be: u32) {
        let word = AF_INET as u64 | ((addr_be as u64) << 32);
        self.body.push(Fragment::StoreMem {
            base: Value::Global(global.to_string()),
            disp,
            value: Value::Int(word as i64),
            width: Width::Quad,
        });
        self.body.push(Fragment::StoreMem {
            base: Value::Global(global.to_string()),
            disp: disp + 8,
            value: Value::Int(0),
            width: Width::Quad,
        });
    }

    fn configure_network(&mut self, net: &NetworkConfig) -> Result<()> {
        let (addr, prefix) = parse_cidr(&net.address)?;
        let gateway = parse_ipv4(&net.gateway)?;
        let netmask = prefix_mask(prefix);

        // sock = socket(AF_INET, SOCK_DGRAM, 0)
        self.syscall_checked(
            self.nr.socket,
            vec![Value::Int(AF_INET), Value::Int(SOCK_DGRAM), Value::Int(0)],
        );
        self.body.push(Fragment::Assign {
            name: "sock".into(),
            value: Value::var("ret"),
        });

        // struct ifreq: 16-byte name, then the request union.
        let ifreq = self.fresh_global("ifreq", 40, 8);
        let name_word = u64::from_le_bytes(*b"eth0\0\0\0\0");
        self.body.push(Fragment::StoreMem {
            base: Value::Global(ifreq.clone()),
            disp: 0,
            value: Value::Int(name_word as i64),
            width: Width::Quad,
        });
        self.body.push(Fragment::StoreMem {
            base: Value::Global(ifreq.clone()),
            disp: 8,
            value: Value::Int(0),
            width: Width::Quad,
        });

        // SIOCSIFADDR, then SIOCSIFNETMASK, then IFF_UP|IFF_RUNNING.
        self.store_sockaddr_in(&ifreq, 16, addr);
        self.syscall_checked(
            self.nr.ioctl,
            vec![
                Value::var("sock"),
                Value::Int(SIOCSIFADDR),
                Value::Global(ifreq.clone()),
            ],
        );
        self.store_sockaddr_in(&ifreq, 16, netmask);
        self.syscall_checked(
            self.nr.ioctl,
            vec![
                Value::var("sock"),
                Value::Int(SIOCSIFNETMASK),
                Value::Global(ifreq.clone()),
            ],
        );
        self.body.push(Fragment::StoreMem {
            base: Value::Global(ifreq.clone()),
            disp: 16,
            value: Value::Int(IFF_UP_RUNNING),
            width: Width::Quad,
        });
        self.syscall_checked(
            self.nr.ioctl,
            vec![
                Value::var("sock"),
                Value::Int(SIOCSIFFLAGS),
                Value::Global(ifreq.clone()),
            ],
        );

        // Default route through the gateway: struct rtentry.
        let rt = self.fresh_global("rtentry", 120, 8);
        self.store_sockaddr_in(&rt, 8, 0); // rt_dst 0.0.0.0
        self.store_sockaddr_in(&rt, 24, gateway); // rt_gateway
        self.store_sockaddr_in(&rt, 40, 0); // rt_genmask 0.0.0.0
        self.body.push(Fragment::StoreMem {
            base: Value::Global(rt.clone()),
            disp: 56,
            value: Value::Int(0x3), // RTF_UP | RTF_GATEWAY
            width: Width::Quad,
        });
        self.syscall_checked(
            self.nr.ioctl,
            vec![Value::var("sock"), Value::Int(SIOCADDRT), Value::Global(rt)],
        );
        self.syscall(self.nr.close, vec![Value::var("sock")]);

        // /etc/resolv.conf
        let resolv = format!("nameserver {}\n", net.nameserver);
        let path = self.string("/etc/resolv.conf");
        self.syscall_checked(
            self.nr.openat,
            vec![
                Value::Int(AT_FDCWD),
                path,
                Value::Int(O_WRONLY_CREAT_TRUNC),
                Value::Int(0o644),
            ],
        );
        self.body.push(Fragment::Assign {
            name: "fd".into(),
            value: Value::var("ret"),
        });
        let content = self.string(&resolv);
        let len = resolv.len() as i64;
        self.syscall(
            self.nr.write,
            vec![Value::var("fd"), content, Value::Int(len)],
        );
        self.syscall(self.nr.close, vec![Value::var("fd")]);
        Ok(())
    }

    fn finish(mut self, cfg: &InitConfig) -> Result<Program> {
        let nr_mkdirat = self.nr.mkdirat;
        let nr_mount = self.nr.mount;
        let nr_pivot = self.nr.pivot_root;
        let nr_chroot = self.nr.chroot;

        // Mount points on the initramfs root.
        self.mkdir("/mnt");
        self.mkdir("/proc");
        self.mkdir("/sys");

        // The container root arrives over virtio-fs.
        self.mount(&cfg.fs_tag, "/mnt", "virtiofs", None);

        // Pseudo-filesystems inside the new root.
        for dir in ["/mnt/proc", "/mnt/sys", "/mnt/dev", "/mnt/tmp"] {
            let p = self.string(dir);
            self.syscall(nr_mkdirat, vec![Value::Int(AT_FDCWD), p, Value::Int(0o755)]);
        }
        self.mount("proc", "/mnt/proc", "proc", None);
        self.mount("sysfs", "/mnt/sys", "sysfs", None);
        self.mount("devtmpfs", "/mnt/dev", "devtmpfs", None);
        self.mkdir("/mnt/dev/shm");
        self.mount("tmpfs", "/mnt/dev/shm", "tmpfs", Some("mode=1777"));

        // Swap roots: pivot_root, falling back to chroot.
        self.chdir("/mnt");
        self.mkdir("oldroot");
        let dot = self.string(".");
        let oldroot = self.string("oldroot");
        self.syscall(nr_pivot, vec![dot.clone(), oldroot]);
        self.body.push(Fragment::If {
            cond: Cond::IsNegative(Value::var("ret")),
            then_block: vec![
                Fragment::Syscall {
                    nr: nr_chroot,
                    args: vec![dot],
                    result: Some("ret".into()),
                },
                Fragment::If {
                    cond: Cond::IsNegative(Value::var("ret")),
                    then_block: vec![Fragment::Goto("fail".into())],
                    else_block: vec![],
                },
            ],
            else_block: vec![],
        });
        self.chdir("/");

        // Drop the old root if the pivot succeeded.
        let old = self.string("/oldroot");
        self.syscall(self.nr.umount2, vec![old.clone(), Value::Int(MNT_DETACH)]);
        self.syscall(
            self.nr.unlinkat,
            vec![Value::Int(AT_FDCWD), old, Value::Int(AT_REMOVEDIR)],
        );

        // Terminal multiplexing needs /dev/pts.
        let pts = self.string("/dev/pts");
        self.syscall(nr_mkdirat, vec![Value::Int(AT_FDCWD), pts, Value::Int(0o755)]);
        self.mount("devpts", "/dev/pts", "devpts", None);

        let host = self.string(&cfg.hostname);
        self.syscall(
            self.nr.sethostname,
            vec![host, Value::Int(cfg.hostname.len() as i64)],
        );

        if let Some(net) = &cfg.network {
            self.configure_network(net)?;
        }

        self.chdir(&cfg.working_dir);

        // exec the container command.
        let argv0 = self.string(&cfg.argv[0]);
        let argv = self.pointer_vec(&cfg.argv);
        let envp = self.pointer_vec(&cfg.env);
        if cfg.pid1 {
            self.syscall_checked(self.nr.execve, vec![argv0, argv, envp]);
        } else {
            // clone(SIGCHLD): child execs, parent reaps then powers down.
            self.syscall_checked(
                self.nr.clone,
                vec![
                    Value::Int(17), // SIGCHLD
                    Value::Int(0),
                    Value::Int(0),
                    Value::Int(0),
                    Value::Int(0),
                ],
            );
            self.body.push(Fragment::If {
                cond: Cond::IsZero(Value::var("ret")),
                then_block: vec![
                    Fragment::Syscall {
                        nr: self.nr.execve,
                        args: vec![argv0, argv, envp],
                        result: Some("ret".into()),
                    },
                    Fragment::Goto("fail".into()),
                ],
                else_block: vec![],
            });
            let status = self.fresh_global("wstatus", 8, 8);
            self.syscall(
                self.nr.wait4,
                vec![
                    Value::Int(-1),
                    Value::Global(status),
                    Value::Int(0),
                    Value::Int(0),
                ],
            );
            self.syscall(
                self.nr.reboot,
                vec![
                    Value::Int(REBOOT_MAGIC1),
                    Value::Int(REBOOT_MAGIC2),
                    Value::Int(SysNr::fatal_reboot_cmd(self.target)),
                    Value::Int(0),
                ],
            );
        }

        // Fatal path: report errno and reboot the guest.
        self.body.push(Fragment::Label("fail".into()));
        self.body.push(Fragment::BinOp {
            dst: "errno".into(),
            op: crate::codegen::Op::Sub,
            lhs: Value::Int(0),
            rhs: Value::var("ret"),
        });
        self.body.push(Fragment::Printf {
            parts: vec![
                PrintfPart::Text("cc: fatal error during boot: errno=0x".into()),
                PrintfPart::Hex(Value::var("errno")),
                PrintfPart::Text("\n".into()),
            ],
        });
        self.syscall(
            self.nr.reboot,
            vec![
                Value::Int(REBOOT_MAGIC1),
                Value::Int(REBOOT_MAGIC2),
                Value::Int(SysNr::fatal_reboot_cmd(self.target)),
                Value::Int(0),
            ],
        );
        // The reboot call does not return; exit is belt and braces.
        self.syscall(self.nr.exit, vec![Value::Int(1)]);

        let mut body = self.string_init_fragments();
        body.extend(std::mem::take(&mut self.body));
        let mut program = Program {
            methods: vec![Method {
                name: "main".into(),
                body,
            }],
            globals: Vec::new(),
        };
        program.globals = self.globals;
        Ok(program)
    }
}

/// Build the IR program implementing the guest init sequence.
pub fn build_init_program(cfg: &InitConfig, target: Target) -> Result<Program> {
    if cfg.argv.is_empty() {
        return Err(crate::Error::Config("init program needs an argv".into()));
    }
    Builder::new(target).finish(cfg)
}

/// Compile the guest init straight to an ELF for the initramfs.
pub fn build_init_elf(cfg: &InitConfig, target: Target) -> Result<Vec<u8>> {
    let program = build_init_program(cfg, target)?;
    compile(&program, target)
}

fn parse_ipv4(s: &str) -> Result<u32> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 4 {
        return Err(crate::Error::Config(format!("invalid IPv4 address {s:?}")));
    }
    let mut out = 0u32;
    for (i, p) in parts.iter().enumerate() {
        let octet: u32 = p
            .parse()
            .map_err(|_| crate::Error::Config(format!("invalid IPv4 address {s:?}")))?;
        if octet > 255 {
            return Err(crate::Error::Config(format!("invalid IPv4 address {s:?}")));
        }
        // Stored little-endian so the in-memory bytes are network order.
        out |= octet << (8 * i);
    }
    Ok(out)
}

fn parse_cidr(s: &str) -> Result<(u32, u8)> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| crate::Error::Config(format!("invalid CIDR {s:?}")))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| crate::Error::Config(format!("invalid CIDR {s:?}")))?;
    if prefix > 32 {
        return Err(crate::Error::Config(format!("invalid CIDR {s:?}")));
    }
    Ok((parse_ipv4(addr)?, prefix))
}

/// Network-order netmask bytes for a prefix length, as a host-memory u32.
fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        return 0;
    }
    let be = (!0u32) << (32 - prefix as u32);
    be.swap_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> InitConfig {
        InitConfig {
            fs_tag: "rootfs".into(),
            hostname: "cc".into(),
            working_dir: "/".into(),
            argv: vec!["/bin/sh".into(), "-c".into(), "echo hello".into()],
            env: vec!["PATH=/usr/bin:/bin".into(), "HOME=/root".into()],
            network: Some(NetworkConfig::default()),
            pid1: false,
        }
    }

    #[test]
    fn ipv4_parsing_is_network_order() {
        // 10.42.0.2 laid out in memory as 0a 2a 00 02.
        assert_eq!(parse_ipv4("10.42.0.2").unwrap(), 0x0200_2a0a);
        assert!(parse_ipv4("10.42.0").is_err());
        assert!(parse_ipv4("300.1.1.1").is_err());
    }

    #[test]
    fn cidr_and_mask() {
        let (addr, prefix) = parse_cidr("10.42.0.2/24").unwrap();
        assert_eq!(addr, 0x0200_2a0a);
        assert_eq!(prefix, 24);
        assert_eq!(prefix_mask(24), 0x00ff_ffff);
        assert_eq!(prefix_mask(16), 0x0000_ffff);
        assert_eq!(prefix_mask(0), 0);
        assert!(parse_cidr("10.42.0.2").is_err());
    }

    #[test]
    fn program_has_fail_label_and_reaper() {
        let program = build_init_program(&config(), Target::X86_64).unwrap();
        assert_eq!(program.methods.len(), 1);
        let body = &program.methods[0].body;
        assert!(body
            .iter()
            .any(|f| matches!(f, Fragment::Label(l) if l == "fail")));
        // Non-PID1: clone at the top level, execve inside the child branch.
        assert!(body
            .iter()
            .any(|f| matches!(f, Fragment::Syscall { nr, .. } if *nr == 56)), "clone");
        assert!(body
            .iter()
            .any(|f| matches!(f, Fragment::Syscall { nr, .. } if *nr == 61)), "wait4");
        assert!(body
            .iter()
            .any(|f| matches!(f, Fragment::Printf { .. })));
    }

    #[test]
    fn pid1_execs_directly() {
        let mut cfg = config();
        cfg.pid1 = true;
        let program = build_init_program(&cfg, Target::X86_64).unwrap();
        assert!(program.methods[0]
            .body
            .iter()
            .any(|f| matches!(f, Fragment::Syscall { nr, .. } if *nr == 59)), "execve");
    }

    #[test]
    fn pid1_skips_clone() {
        let mut cfg = config();
        cfg.pid1 = true;
        let program = build_init_program(&cfg, Target::X86_64).unwrap();
        assert!(!program.methods[0]
            .body
            .iter()
            .any(|f| matches!(f, Fragment::Syscall { nr, .. } if *nr == 56)), "no clone");
    }

    #[test]
    fn compiles_for_both_targets() {
        for target in [Target::X86_64, Target::Aarch64] {
            let elf = build_init_elf(&config(), target).unwrap();
            assert_eq!(&elf[..4], b"\x7fELF");
            // No unresolved tokens anywhere in the file.
            for i in 0..elf.len() - 7 {
                let word = u64::from_le_bytes(elf[i..i + 8].try_into().unwrap());
                assert_ne!(word >> 48, 0x5ead, "method token at {i:#x}");
                assert_ne!(word >> 48, 0x5eae, "global token at {i:#x}");
            }
        }
    }

    #[test]
    fn network_is_optional() {
        let mut cfg = config();
        cfg.network = None;
        let program = build_init_program(&cfg, Target::X86_64).unwrap();
        // No socket() call when networking is off.
        assert!(!program.methods[0]
            .body
            .iter()
            .any(|f| matches!(f, Fragment::Syscall { nr, .. } if *nr == 41)));
    }
}
