use std::sync::LazyLock;

use regex::Regex;

use super::{ContainerType, Error, Result};

static DOCKER_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([a-z0-9]{64})").expect("valid docker id pattern"));
static CONTAINERD_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"cri-containerd[-:]([a-z0-9]{64})").expect("valid containerd id pattern")
});
static SYSTEM_SLICE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(/(system|runtime)\.slice/([^/]+))").expect("valid system slice pattern")
});

/// Classifies a host-relative cgroup path.
///
/// Rules are applied in order and the first match wins:
///
/// 1. `user.slice/...` and `init.scope/...` are standalone processes.
/// 2. `docker/...` and `system.slice/docker-*` are docker containers.
/// 3. Anything under `kubepods` is a containerd container, a docker container,
///    or a pod sandbox, in that preference.
/// 4. `system.slice/...` and `runtime.slice/...` are systemd services.
///
/// Paths with fewer than two segments are standalone processes.
///
/// # Errors
///
/// Returns an error if the path looks like a docker or systemd cgroup but carries
/// no id, or if it matches no known layout at all.
///
/// # Examples
///
/// ```
/// # use sense_agent::cgroup::{container_by_cgroup, ContainerType};
/// let (kind, id) = container_by_cgroup("/user.slice/user-1000.slice").unwrap();
/// assert_eq!(kind, ContainerType::StandaloneProcess);
/// assert!(id.is_empty());
/// ```
pub fn container_by_cgroup(path: &str) -> Result<(ContainerType, String)> {
    let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    if parts.len() < 2 {
        return Ok((ContainerType::StandaloneProcess, String::new()));
    }

    let prefix = parts[0];
    if prefix == "user.slice" || prefix == "init.scope" {
        return Ok((ContainerType::StandaloneProcess, String::new()));
    }

    // 9:memory:/system.slice/docker-<id>.scope
    // 8:pids:/docker/<id>
    if prefix == "docker" || (prefix == "system.slice" && parts[1].starts_with("docker-")) {
        return match DOCKER_ID.captures(path) {
            Some(caps) => Ok((ContainerType::Docker, caps[1].to_owned())),
            None => Err(Error::InvalidDockerCgroup(path.to_owned())),
        };
    }

    // 0::/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod<uid>.slice/cri-containerd-<id>.scope
    if path.contains("kubepods") {
        if let Some(caps) = CONTAINERD_ID.captures(path) {
            return Ok((ContainerType::Containerd, caps[1].to_owned()));
        }
        return match DOCKER_ID.captures(path) {
            Some(caps) => Ok((ContainerType::Docker, caps[1].to_owned())),
            None => Ok((ContainerType::Sandbox, String::new())),
        };
    }

    if prefix == "system.slice" || prefix == "runtime.slice" {
        return match SYSTEM_SLICE_ID.captures(path) {
            Some(caps) => Ok((ContainerType::SystemdService, caps[1].to_owned())),
            None => Err(Error::InvalidSystemdCgroup(path.to_owned())),
        };
    }

    Err(Error::UnknownContainer(path.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const ID_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    #[test]
    fn test_docker_cgroupfs_layout() {
        let (kind, id) = container_by_cgroup(&format!("/docker/{ID_A}")).unwrap();
        assert_eq!(kind, ContainerType::Docker);
        assert_eq!(id, ID_A);
    }

    #[test]
    fn test_docker_systemd_layout() {
        let path =
            "/system.slice/docker-3b4c4778e0f6640cb1cddd1eddf22638b37ef6e44ce3a6a6264262ccc0353232.scope";
        let (kind, id) = container_by_cgroup(path).unwrap();
        assert_eq!(kind, ContainerType::Docker);
        assert_eq!(
            id,
            "3b4c4778e0f6640cb1cddd1eddf22638b37ef6e44ce3a6a6264262ccc0353232"
        );
    }

    #[test]
    fn test_docker_without_id_is_error() {
        let err = container_by_cgroup("/docker/not-an-id").unwrap_err();
        assert!(matches!(err, Error::InvalidDockerCgroup(_)));
    }

    #[test]
    fn test_containerd_under_kubepods() {
        let path = format!(
            "/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-podX.slice/cri-containerd-{ID_B}.scope"
        );
        let (kind, id) = container_by_cgroup(&path).unwrap();
        assert_eq!(kind, ContainerType::Containerd);
        assert_eq!(id, ID_B);
    }

    #[test]
    fn test_containerd_wins_over_stray_hex() {
        let path = format!("/kubepods/burstable/pod{ID_A}/cri-containerd:{ID_B}");
        let (kind, id) = container_by_cgroup(&path).unwrap();
        assert_eq!(kind, ContainerType::Containerd);
        assert_eq!(id, ID_B);
    }

    #[test]
    fn test_docker_under_kubepods() {
        let path = format!("/kubepods/besteffort/pod1234/{ID_A}");
        let (kind, id) = container_by_cgroup(&path).unwrap();
        assert_eq!(kind, ContainerType::Docker);
        assert_eq!(id, ID_A);
    }

    #[test]
    fn test_kubepods_without_id_is_sandbox() {
        let (kind, id) =
            container_by_cgroup("/kubepods.slice/kubepods-besteffort.slice").unwrap();
        assert_eq!(kind, ContainerType::Sandbox);
        assert!(id.is_empty());
    }

    #[test]
    fn test_kubepods_checked_before_system_slice() {
        let path = format!("/system.slice/kubepods-burstable.slice/cri-containerd-{ID_B}.scope");
        let (kind, _) = container_by_cgroup(&path).unwrap();
        assert_eq!(kind, ContainerType::Containerd);
    }

    #[test]
    fn test_standalone() {
        for path in [
            "/user.slice/user-1000.slice",
            "/user.slice/user-1000.slice/session-2.scope",
            "/init.scope/child",
            "/init.scope",
            "/",
            "",
        ] {
            let (kind, id) = container_by_cgroup(path).unwrap();
            assert_eq!(kind, ContainerType::StandaloneProcess, "path {path}");
            assert!(id.is_empty());
        }
    }

    #[test]
    fn test_systemd_service() {
        let (kind, id) = container_by_cgroup("/system.slice/nginx.service").unwrap();
        assert_eq!(kind, ContainerType::SystemdService);
        assert_eq!(id, "/system.slice/nginx.service");

        let (kind, id) =
            container_by_cgroup("/runtime.slice/kubelet.service/extra").unwrap();
        assert_eq!(kind, ContainerType::SystemdService);
        assert_eq!(id, "/runtime.slice/kubelet.service");
    }

    #[test]
    fn test_unknown_deep_path_is_error() {
        let err = container_by_cgroup("/machine.slice/libvirt-qemu").unwrap_err();
        assert!(matches!(err, Error::UnknownContainer(_)));
    }

    #[test]
    fn test_classification_is_deterministic() {
        let path = format!("/kubepods/burstable/pod1/{ID_A}");
        let first = container_by_cgroup(&path).unwrap();
        for _ in 0..10 {
            assert_eq!(container_by_cgroup(&path).unwrap(), first);
        }
    }
}
