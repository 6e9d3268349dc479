use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::classify::container_by_cgroup;
use super::namespace::CgroupPrefix;
use super::parser::{join_cgroup_path, parse_cgroup_line};
use super::{Cgroup, Error, Result, Version};
use crate::{fsutil, proc};

/// Resolves the cgroup of a PID into a host-relative, classified [`Cgroup`].
#[derive(Debug, Clone)]
pub struct CgroupResolver {
    proc_root: PathBuf,
    prefix: CgroupPrefix,
}

impl CgroupResolver {
    /// Creates a resolver reading from `proc_root` and joining every path onto `prefix`.
    pub fn new(proc_root: impl Into<PathBuf>, prefix: CgroupPrefix) -> Self {
        Self {
            proc_root: proc_root.into(),
            prefix,
        }
    }

    pub fn prefix(&self) -> &CgroupPrefix {
        &self.prefix
    }

    /// Reads and classifies `/proc/<pid>/cgroup`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Read`] if the file is unreadable (e.g. the process exited),
    /// a parse error for malformed lines, or a classification error if the path
    /// matches no known layout.
    pub fn read_cgroup_by_pid(&self, pid: u32) -> Result<Cgroup> {
        self.read_cgroup_from_file(proc::path(&self.proc_root, pid, ["cgroup"]))
    }

    /// Reads and classifies the cgroup file at `path`.
    ///
    /// # Errors
    ///
    /// See [`CgroupResolver::read_cgroup_by_pid`].
    pub fn read_cgroup_from_file(&self, path: impl AsRef<Path>) -> Result<Cgroup> {
        let path = path.as_ref();
        let content = fsutil::read_to_string(path)?;
        self.parse_cgroup(&content, path)
    }

    fn parse_cgroup(&self, content: &str, origin: &Path) -> Result<Cgroup> {
        let mut subsystems = HashMap::with_capacity(16);
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let cgl = parse_cgroup_line(line).map_err(|source| Error::Line {
                path: origin.to_path_buf(),
                source,
            })?;
            let cgroup_path = join_cgroup_path(self.prefix.as_str(), cgl.cgroup_path);
            if cgl.controller_list.is_empty() {
                subsystems.insert(String::new(), cgroup_path);
            } else {
                for controller in cgl.controller_list {
                    subsystems.insert(controller.to_owned(), cgroup_path.clone());
                }
            }
        }

        let (id, version) = match subsystems.get("cpu") {
            Some(p) => (p.clone(), Version::V1),
            None => match subsystems.get("") {
                Some(p) => (p.clone(), Version::V2),
                None => {
                    return Err(Error::MissingPath {
                        path: origin.to_path_buf(),
                    });
                }
            },
        };
        log::trace!("cgroup of `{}` is `{}`", origin.display(), id);

        let (container_type, container_id) = container_by_cgroup(&id)?;
        Ok(Cgroup {
            id,
            version,
            container_type,
            container_id,
            subsystems,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::ContainerType;

    const ID: &str = "ffc408b364e6d265434bf40ec532d8d1380c4ec35d1e0b1494ef8cefa4334d90";

    fn write_cgroup(proc_root: &Path, pid: u32, content: &str) {
        let dir = proc_root.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("cgroup"), content).unwrap();
    }

    #[test]
    fn test_v1_uses_cpu_controller() {
        let dir = tempfile::tempdir().unwrap();
        write_cgroup(
            dir.path(),
            42,
            &format!(
                "12:pids:/docker/{ID}\n4:cpu,cpuacct:/docker/{ID}\n1:name=systemd:/docker/{ID}\n"
            ),
        );
        let resolver = CgroupResolver::new(dir.path(), CgroupPrefix::none());
        let cg = resolver.read_cgroup_by_pid(42).unwrap();

        assert_eq!(cg.version, Version::V1);
        assert_eq!(cg.id, format!("/docker/{ID}"));
        assert_eq!(cg.container_type, ContainerType::Docker);
        assert_eq!(cg.container_id, ID);
        assert_eq!(cg.subsystem("cpuacct"), Some(format!("/docker/{ID}").as_str()));
    }

    #[test]
    fn test_v2_uses_unified_path() {
        let dir = tempfile::tempdir().unwrap();
        write_cgroup(dir.path(), 7, "0::/system.slice/nginx.service\n");
        let resolver = CgroupResolver::new(dir.path(), CgroupPrefix::none());
        let cg = resolver.read_cgroup_by_pid(7).unwrap();

        assert_eq!(cg.version, Version::V2);
        assert_eq!(cg.id, "/system.slice/nginx.service");
        assert_eq!(cg.container_type, ContainerType::SystemdService);
    }

    #[test]
    fn test_prefix_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        write_cgroup(dir.path(), 7, &format!("0::/../../pod2/cri-containerd-{ID}.scope\n"));
        let prefix = CgroupPrefix::new("/kubepods.slice/kubepods-pod1.slice/agent.scope");
        let resolver = CgroupResolver::new(dir.path(), prefix);
        let cg = resolver.read_cgroup_by_pid(7).unwrap();

        assert_eq!(cg.id, format!("/kubepods.slice/pod2/cri-containerd-{ID}.scope"));
        assert_eq!(cg.container_type, ContainerType::Containerd);
        assert_eq!(cg.container_id, ID);
    }

    #[test]
    fn test_missing_process() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CgroupResolver::new(dir.path(), CgroupPrefix::none());
        let err = resolver.read_cgroup_by_pid(12345).unwrap_err();
        assert!(err.is_process_gone());
    }

    #[test]
    fn test_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        write_cgroup(dir.path(), 9, "");
        let resolver = CgroupResolver::new(dir.path(), CgroupPrefix::none());
        let err = resolver.read_cgroup_by_pid(9).unwrap_err();
        assert!(matches!(err, Error::MissingPath { .. }));
    }

    #[test]
    fn test_unknown_layout_is_error() {
        let dir = tempfile::tempdir().unwrap();
        write_cgroup(dir.path(), 9, "0::/machine.slice/qemu-1\n");
        let resolver = CgroupResolver::new(dir.path(), CgroupPrefix::none());
        let err = resolver.read_cgroup_by_pid(9).unwrap_err();
        assert!(matches!(err, Error::UnknownContainer(_)));
    }
}
