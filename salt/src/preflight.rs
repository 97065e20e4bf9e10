//! Pre-flight checks for salt
//!
//! Validates the kernel image and the stub address before connecting.
//! Provides clear, actionable error messages when requirements aren't met.

use anyhow::{bail, Context, Result};
use object::{Object, ObjectSection};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

/// Run all pre-flight checks before touching the target
///
/// # Errors
/// The first failed check, with a hint on how to fix it
pub fn run_preflight_checks(vmlinux: &Path, remote: &str) -> Result<SocketAddr> {
    check_image_exists(vmlinux)?;
    check_image_sections(vmlinux)?;
    resolve_remote(remote)
}

/// Check if the kernel image exists and is a regular file
fn check_image_exists(vmlinux: &Path) -> Result<()> {
    if !vmlinux.exists() {
        bail!(
            "Kernel image not found: {}\n\n\
             Point --vmlinux at the uncompressed vmlinux of the running kernel.",
            vmlinux.display()
        );
    }
    if !vmlinux.is_file() {
        bail!(
            "Not a file: {}\n\n\
             --vmlinux must point to the ELF image, not a directory.",
            vmlinux.display()
        );
    }
    Ok(())
}

/// Struct layouts need DWARF, probes and globals need the symbol table
fn check_image_sections(vmlinux: &Path) -> Result<()> {
    let data = std::fs::read(vmlinux)
        .with_context(|| format!("Failed to read kernel image: {}", vmlinux.display()))?;
    let obj = object::File::parse(&*data).with_context(|| {
        format!(
            "Not an ELF image: {}\n\n\
             bzImage/vmlinuz are compressed; extract vmlinux first.",
            vmlinux.display()
        )
    })?;

    let has_symtab = obj.section_by_name(".symtab").is_some_and(|s| s.size() > 0);
    let has_debug_info = obj.section_by_name(".debug_info").is_some_and(|s| s.size() > 0);

    if !has_symtab {
        bail!(
            "Kernel image is stripped: {}\n\n\
             salt needs .symtab to locate slab_caches and the allocator routines.",
            vmlinux.display()
        );
    }
    if !has_debug_info {
        bail!(
            "No DWARF debug info in {}\n\n\
             Rebuild the kernel with CONFIG_DEBUG_INFO=y so struct layouts can be read.",
            vmlinux.display()
        );
    }
    Ok(())
}

/// Resolve `host:port` of the GDB stub
fn resolve_remote(remote: &str) -> Result<SocketAddr> {
    remote
        .to_socket_addrs()
        .with_context(|| {
            format!(
                "Invalid stub address: {remote}\n\n\
                 Expected host:port, e.g. 127.0.0.1:1234 (qemu -s)."
            )
        })?
        .next()
        .with_context(|| format!("Stub address {remote} resolved to nothing"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_not_found() {
        let result = check_image_exists(Path::new("/nonexistent/vmlinux"));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Kernel image not found"));
    }

    #[test]
    fn test_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_image_exists(dir.path()).unwrap_err().to_string();
        assert!(err.contains("Not a file"));
    }

    #[test]
    fn test_non_elf_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"not an elf").unwrap();
        let err = check_image_sections(file.path()).unwrap_err().to_string();
        assert!(err.contains("Not an ELF image"));
    }

    #[test]
    fn test_remote_address() {
        assert_eq!(resolve_remote("127.0.0.1:1234").unwrap().port(), 1234);
        assert!(resolve_remote("no-port-here").is_err());
    }
}
