//! Parser for `/proc/<pid>/cgroup` lines.

#[derive(Debug, thiserror::Error)]
pub enum CgroupLineError {
    #[error("invalid cgroup line format: {0}")]
    InvalidFormat(String),
    #[error("invalid hierarchy id in cgroup line: {0}")]
    InvalidHierarchyID(String),
}

/// One parsed line of a cgroup control file.
#[derive(Debug, PartialEq, Eq)]
pub struct CgroupLine<'a> {
    pub hierarchy_id: u32,
    /// Controllers bound to the hierarchy, empty for the v2 unified hierarchy.
    pub controller_list: Vec<&'a str>,
    pub cgroup_path: &'a str,
}

/// Parses a single `<hierarchy-id>:<controller-list>:<cgroup-path>` line.
///
/// The path is the remainder after the second separator, so paths containing
/// `:` (e.g. `cri-containerd:<id>`) are kept intact.
///
/// # Errors
///
/// Returns [`CgroupLineError`] if a field is missing or the hierarchy id is not numeric.
pub fn parse_cgroup_line(line: &str) -> Result<CgroupLine<'_>, CgroupLineError> {
    let mut it = line.splitn(3, ':');
    let hierarchy_id = it
        .next()
        .ok_or_else(|| CgroupLineError::InvalidFormat(line.to_owned()))?
        .parse::<u32>()
        .map_err(|_| CgroupLineError::InvalidHierarchyID(line.to_owned()))?;
    let controller_list = it
        .next()
        .ok_or_else(|| CgroupLineError::InvalidFormat(line.to_owned()))?;
    let controller_list: Vec<&str> = if controller_list.is_empty() {
        Vec::default()
    } else {
        controller_list.split(',').collect()
    };
    let cgroup_path = it
        .next()
        .ok_or_else(|| CgroupLineError::InvalidFormat(line.to_owned()))?;

    Ok(CgroupLine {
        hierarchy_id,
        controller_list,
        cgroup_path: cgroup_path.trim(),
    })
}

/// Joins a cgroup path onto the namespace prefix and normalizes the result.
///
/// Inside a nested cgroup namespace the kernel renders paths of processes
/// outside the namespace with leading `..` segments; resolving them against the
/// prefix yields the host-relative path. The result always starts with `/`.
pub fn join_cgroup_path(prefix: &str, path: &str) -> String {
    let mut segments: Vec<&str> = Vec::with_capacity(8);
    for segment in prefix.split('/').chain(path.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut out = String::with_capacity(prefix.len() + path.len() + 1);
    for segment in &segments {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}
