//! Just enough Mach-O header parsing to pick the `-arch` flag llvm-cov
//! needs for universal binaries on macOS.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

const FAT_MAGIC: u32 = 0xcafe_babe;
const FAT_MAGIC_64: u32 = 0xcafe_babf;
const MH_MAGIC: u32 = 0xfeed_face;
const MH_MAGIC_64: u32 = 0xfeed_facf;

const CPU_TYPE_X86_64: u32 = 0x0100_0007;
const CPU_TYPE_ARM64: u32 = 0x0100_000c;

// Universal binaries rarely carry more than a handful of slices.
const MAX_FAT_ARCHES: u32 = 64;

#[derive(Error, Debug)]
pub enum MachoError {
    #[error("Failed to read Mach-O file {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("{0:?} is not a Mach-O file")]
    NotMacho(PathBuf),
    #[error("{path:?} has unsupported architecture (cpu type {cpu_type:#x})")]
    UnsupportedArch { path: PathBuf, cpu_type: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Arm64,
    X86_64,
}

impl Arch {
    fn from_cpu_type(cpu_type: u32) -> Option<Self> {
        match cpu_type {
            CPU_TYPE_ARM64 => Some(Arch::Arm64),
            CPU_TYPE_X86_64 => Some(Arch::X86_64),
            _ => None,
        }
    }

    /// The architecture this binary was built for.
    pub fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            Arch::X86_64
        } else {
            Arch::Arm64
        }
    }

    pub fn llvm_cov_flag(self) -> String {
        format!("-arch={self}")
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Arch::Arm64 => "arm64",
            Arch::X86_64 => "x86_64",
        })
    }
}

/// Chooses the slice llvm-cov should read: the host architecture if the
/// file contains it, otherwise any other supported one.
pub fn preferred_arch(path: &Path) -> Result<Arch, MachoError> {
    let io_err = |source| MachoError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_err)?;
    let mut header = [0u8; 8];
    file.read_exact(&mut header).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => MachoError::NotMacho(path.to_path_buf()),
        _ => io_err(e),
    })?;

    let magic_be = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let entry_size = match magic_be {
        FAT_MAGIC => Some(20),
        FAT_MAGIC_64 => Some(32),
        _ => None,
    };
    let Some(entry_size) = entry_size else {
        return thin_arch(path, &header);
    };

    let count = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if count == 0 || count > MAX_FAT_ARCHES {
        return Err(MachoError::NotMacho(path.to_path_buf()));
    }
    let mut entries = vec![0u8; count as usize * entry_size];
    file.read_exact(&mut entries).map_err(io_err)?;

    let cpu_types: Vec<u32> = entries
        .chunks_exact(entry_size)
        .map(|e| u32::from_be_bytes([e[0], e[1], e[2], e[3]]))
        .collect();
    select_arch(path, &cpu_types, Arch::host())
}

fn thin_arch(path: &Path, header: &[u8; 8]) -> Result<Arch, MachoError> {
    let magic_le = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let magic_be = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let cpu_type = if magic_le == MH_MAGIC || magic_le == MH_MAGIC_64 {
        u32::from_le_bytes([header[4], header[5], header[6], header[7]])
    } else if magic_be == MH_MAGIC || magic_be == MH_MAGIC_64 {
        u32::from_be_bytes([header[4], header[5], header[6], header[7]])
    } else {
        return Err(MachoError::NotMacho(path.to_path_buf()));
    };
    Arch::from_cpu_type(cpu_type).ok_or(MachoError::UnsupportedArch {
        path: path.to_path_buf(),
        cpu_type,
    })
}

fn select_arch(path: &Path, cpu_types: &[u32], host: Arch) -> Result<Arch, MachoError> {
    let supported: Vec<Arch> = cpu_types
        .iter()
        .filter_map(|&cpu| Arch::from_cpu_type(cpu))
        .collect();
    if supported.contains(&host) {
        return Ok(host);
    }
    supported
        .last()
        .copied()
        .ok_or_else(|| MachoError::UnsupportedArch {
            path: path.to_path_buf(),
            cpu_type: cpu_types.first().copied().unwrap_or_default(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fat(cpu_types: &[u32]) -> Vec<u8> {
        let mut data = FAT_MAGIC.to_be_bytes().to_vec();
        data.extend((cpu_types.len() as u32).to_be_bytes());
        for cpu in cpu_types {
            data.extend(cpu.to_be_bytes());
            // cpusubtype, offset, size, align
            data.extend([0u8; 16]);
        }
        data
    }

    fn write(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn universal_binary_prefers_host() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "fat", &fat(&[CPU_TYPE_X86_64, CPU_TYPE_ARM64]));
        assert_eq!(preferred_arch(&path).unwrap(), Arch::host());
    }

    #[test]
    fn falls_back_to_other_supported_arch() {
        let path = Path::new("fat");
        let powerpc = 0x12;
        assert_eq!(
            select_arch(path, &[powerpc, CPU_TYPE_ARM64], Arch::X86_64).unwrap(),
            Arch::Arm64
        );
        assert!(matches!(
            select_arch(path, &[powerpc], Arch::X86_64),
            Err(MachoError::UnsupportedArch { cpu_type: 0x12, .. })
        ));
    }

    #[test]
    fn thin_little_endian_binary() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = MH_MAGIC_64.to_le_bytes().to_vec();
        data.extend(CPU_TYPE_ARM64.to_le_bytes());
        data.extend([0u8; 24]);
        let path = write(dir.path(), "thin", &data);
        assert_eq!(preferred_arch(&path).unwrap(), Arch::Arm64);
        assert_eq!(Arch::Arm64.llvm_cov_flag(), "-arch=arm64");
    }

    #[test]
    fn rejects_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let elf = write(dir.path(), "elf", b"\x7fELF\x02\x01\x01\x00rest");
        assert!(matches!(preferred_arch(&elf), Err(MachoError::NotMacho(_))));
        let short = write(dir.path(), "short", b"\xca\xfe");
        assert!(matches!(preferred_arch(&short), Err(MachoError::NotMacho(_))));
    }
}
