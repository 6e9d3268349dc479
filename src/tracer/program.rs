use std::path::{Path, PathBuf};

use super::decode::RecordKind;
use super::{Error, Result};
use crate::proc::KernelVersion;

/// A perf event array declared by the instrumentation image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfMapSpec {
    pub name: &'static str,
    pub kind: RecordKind,
    /// Per-CPU buffer size in pages.
    pub pages: usize,
}

pub const PERF_MAPS: [PerfMapSpec; 6] = [
    PerfMapSpec {
        name: "proc_events",
        kind: RecordKind::Proc,
        pages: 4,
    },
    PerfMapSpec {
        name: "tcp_listen_events",
        kind: RecordKind::Tcp,
        pages: 4,
    },
    PerfMapSpec {
        name: "tcp_connect_events",
        kind: RecordKind::Tcp,
        pages: 8,
    },
    PerfMapSpec {
        name: "tcp_retransmit_events",
        kind: RecordKind::Tcp,
        pages: 4,
    },
    PerfMapSpec {
        name: "file_events",
        kind: RecordKind::File,
        pages: 4,
    },
    PerfMapSpec {
        name: "l7_events",
        kind: RecordKind::L7,
        pages: 32,
    },
];

/// A precompiled instrumentation object and the minimum kernel it supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramImage {
    pub min_kernel: KernelVersion,
    pub path: PathBuf,
}

/// Lists the images available for `arch` under `ebpf_dir`.
///
/// Images are stored as `<ebpf_dir>/<arch>/v<MAJOR>.<MINOR>.o`. Files with other
/// names are ignored.
///
/// # Errors
///
/// Returns [`Error::UnsupportedArchitecture`] if the architecture directory is
/// missing or holds no image.
pub fn list_images(ebpf_dir: &Path, arch: &str) -> Result<Vec<ProgramImage>> {
    let dir = ebpf_dir.join(arch);
    let entries = std::fs::read_dir(&dir).map_err(|err| {
        log::debug!("failed to read image directory `{}`: {}", dir.display(), err);
        Error::UnsupportedArchitecture(arch.to_owned())
    })?;

    let mut images = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "o") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match stem.parse::<KernelVersion>() {
            Ok(min_kernel) => images.push(ProgramImage { min_kernel, path }),
            Err(err) => log::warn!("skipping image `{}`: {}", path.display(), err),
        }
    }

    if images.is_empty() {
        return Err(Error::UnsupportedArchitecture(arch.to_owned()));
    }
    Ok(images)
}

/// Picks the image with the highest minimum kernel version that `kernel` satisfies.
pub fn select_image(images: &[ProgramImage], kernel: KernelVersion) -> Option<&ProgramImage> {
    images
        .iter()
        .filter(|image| image.min_kernel <= kernel)
        .max_by_key(|image| image.min_kernel)
}

/// Whether a program section is a user-space probe placeholder.
pub fn is_uprobe_section(section: &str) -> bool {
    section.starts_with("uprobe/") || section.starts_with("uretprobe/")
}

/// Splits a `tracepoint/<category>/<name>` section into its category and name.
pub fn tracepoint_target(section: &str) -> Option<(&str, &str)> {
    let target = section
        .strip_prefix("tracepoint/")
        .or_else(|| section.strip_prefix("tp/"))?;
    target.split_once('/')
}

/// Extracts the kernel function of a `kprobe/<fn>` or `kretprobe/<fn>` section.
///
/// Returns the function name and whether it is a return probe.
pub fn kprobe_target(section: &str) -> Option<(&str, bool)> {
    if let Some(func) = section.strip_prefix("kretprobe/") {
        return Some((func, true));
    }
    section.strip_prefix("kprobe/").map(|func| (func, false))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(major: u32, minor: u32) -> ProgramImage {
        ProgramImage {
            min_kernel: KernelVersion::new(major, minor),
            path: PathBuf::from(format!("v{major}.{minor}.o")),
        }
    }

    #[test]
    fn selects_highest_satisfied_image() {
        let images = vec![image(4, 16), image(5, 1), image(5, 10), image(6, 2)];
        let chosen = select_image(&images, KernelVersion::new(5, 15)).unwrap();
        assert_eq!(chosen.min_kernel, KernelVersion::new(5, 10));

        let chosen = select_image(&images, KernelVersion::new(5, 10)).unwrap();
        assert_eq!(chosen.min_kernel, KernelVersion::new(5, 10));

        let chosen = select_image(&images, KernelVersion::new(6, 8)).unwrap();
        assert_eq!(chosen.min_kernel, KernelVersion::new(6, 2));
    }

    #[test]
    fn minor_versions_compare_numerically() {
        let images = vec![image(5, 2), image(5, 10)];
        let chosen = select_image(&images, KernelVersion::new(5, 9)).unwrap();
        assert_eq!(chosen.min_kernel, KernelVersion::new(5, 2));
    }

    #[test]
    fn no_image_for_old_kernel() {
        let images = vec![image(4, 16)];
        assert!(select_image(&images, KernelVersion::new(4, 14)).is_none());
    }

    #[test]
    fn lists_images_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let arch_dir = dir.path().join("x86_64");
        std::fs::create_dir_all(&arch_dir).unwrap();
        for name in ["v4.16.o", "v5.1.o", "README", "broken.o"] {
            std::fs::write(arch_dir.join(name), b"").unwrap();
        }

        let mut images = list_images(dir.path(), "x86_64").unwrap();
        images.sort_by_key(|i| i.min_kernel);
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].min_kernel, KernelVersion::new(4, 16));
        assert_eq!(images[1].path, arch_dir.join("v5.1.o"));
    }

    #[test]
    fn missing_architecture() {
        let dir = tempfile::tempdir().unwrap();
        let err = list_images(dir.path(), "riscv64").unwrap_err();
        assert!(matches!(err, Error::UnsupportedArchitecture(arch) if arch == "riscv64"));

        std::fs::create_dir_all(dir.path().join("aarch64")).unwrap();
        let err = list_images(dir.path(), "aarch64").unwrap_err();
        assert!(matches!(err, Error::UnsupportedArchitecture(_)));
    }

    #[test]
    fn section_targets() {
        assert_eq!(
            tracepoint_target("tracepoint/sched/sched_process_exit"),
            Some(("sched", "sched_process_exit"))
        );
        assert_eq!(tracepoint_target("kprobe/tcp_connect"), None);
        assert_eq!(kprobe_target("kprobe/tcp_connect"), Some(("tcp_connect", false)));
        assert_eq!(
            kprobe_target("kretprobe/inet_csk_accept"),
            Some(("inet_csk_accept", true))
        );
        assert!(is_uprobe_section("uprobe/go_crypto_tls_write"));
        assert!(!is_uprobe_section("kprobe/tcp_connect"));
    }

    #[test]
    fn perf_map_hints() {
        let l7 = PERF_MAPS.iter().find(|m| m.name == "l7_events").unwrap();
        assert_eq!(l7.pages, 32);
        let connect = PERF_MAPS.iter().find(|m| m.name == "tcp_connect_events").unwrap();
        assert_eq!(connect.pages, 8);
    }
}
