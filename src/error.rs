//! Error types for cc-vmm

use thiserror::Error;

/// Result type alias using the cc-vmm Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or running a VM.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid machine configuration: overlapping device ranges, bad image
    /// headers, unsupported host combinations.
    #[error("configuration error: {0}")]
    Config(String),

    /// The guest did something the device model cannot resolve: an exit the
    /// dispatcher does not own, a malformed virtqueue, a response overflow.
    #[error("guest error: {0}")]
    Guest(String),

    /// Host-side failure: a hypervisor syscall or a guest memory mapping.
    #[error("host error: {0}")]
    Host(String),

    /// No usable hardware accelerator on this host OS/arch combination.
    #[error("no supported hypervisor on this host")]
    HypervisorUnsupported,

    /// KVM ioctl failure (Linux only)
    #[cfg(target_os = "linux")]
    #[error("KVM error: {0}")]
    Kvm(#[from] kvm_ioctls::Error),

    /// Guest memory access failure
    #[error("memory error: {0}")]
    Memory(#[from] vm_memory::GuestMemoryError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the error names a host-side failure rather than guest or
    /// configuration misbehavior. Used by the CLI to pick an exit category.
    pub fn is_host_error(&self) -> bool {
        match self {
            Error::Host(_) | Error::Io(_) | Error::Memory(_) => true,
            #[cfg(target_os = "linux")]
            Error::Kvm(_) => true,
            _ => false,
        }
    }
}

/// How a VM run ended when it did not fail.
///
/// Reboot requests and halts are not errors: the run loop returns them
/// distinctly so the caller can treat a guest-initiated shutdown as a clean
/// exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A vCPU executed the halt instruction with interrupts disabled.
    Halted,
    /// The guest asked for a reset (reset port write or PSCI power-off).
    RebootRequested,
    /// The caller's cancellation token tripped.
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let e = Error::Config("ports 0x60..0x64 overlap".into());
        assert!(e.to_string().contains("configuration error"));
        assert!(!e.is_host_error());
    }

    #[test]
    fn host_error_category() {
        let e = Error::Host("mmap failed".into());
        assert!(e.is_host_error());
    }
}
