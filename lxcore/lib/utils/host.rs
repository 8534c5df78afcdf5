use std::thread;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the number of logical CPUs of the host, at least 1.
pub fn host_cpu_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Returns the host's native architecture in LXC image naming.
pub fn host_architecture() -> &'static str {
    lxc_architecture(std::env::consts::ARCH)
}

/// Maps a Rust target architecture name to the name LXC images use.
pub fn lxc_architecture(arch: &'static str) -> &'static str {
    match arch {
        "x86_64" => "amd64",
        "x86" => "i386",
        "aarch64" => "arm64",
        "arm" => "armhf",
        "powerpc64" => "ppc64el",
        "riscv64" => "riscv64",
        "s390x" => "s390x",
        other => other,
    }
}

/// Resolves the compressor thread count.
///
/// An explicit value is capped at `host_cpus`; `0` means half of the host's CPUs, at least one.
pub fn compressor_threads(requested: usize, host_cpus: usize) -> usize {
    let host_cpus = host_cpus.max(1);
    match requested {
        0 => (host_cpus / 2).max(1),
        n => n.min(host_cpus),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressor_threads() {
        assert_eq!(compressor_threads(0, 8), 4);
        assert_eq!(compressor_threads(0, 1), 1);
        assert_eq!(compressor_threads(0, 3), 1);
        assert_eq!(compressor_threads(16, 8), 8);
        assert_eq!(compressor_threads(2, 8), 2);
    }

    #[test]
    fn test_lxc_architecture() {
        assert_eq!(lxc_architecture("x86_64"), "amd64");
        assert_eq!(lxc_architecture("aarch64"), "arm64");
        assert_eq!(lxc_architecture("mips"), "mips");
    }
}
