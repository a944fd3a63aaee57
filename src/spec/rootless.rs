//! Rootless spec conversion
//!
//! Without root on the host the runtime can neither mount a fresh sysfs nor
//! manage cgroups, so both are replaced by what an unprivileged user may do.

use crate::error::Result;
use oci_spec::runtime::{MountBuilder, Spec};
use std::path::Path;

fn current_oom_score_adj() -> Option<i32> {
    std::fs::read_to_string("/proc/self/oom_score_adj")
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Convert `spec` for a runtime started without root privileges
pub fn to_rootless(spec: &mut Spec) -> Result<()> {
    convert(spec, current_oom_score_adj())
}

fn convert(spec: &mut Spec, current_oom: Option<i32>) -> Result<()> {
    let sys = MountBuilder::default()
        .destination("/sys")
        .typ("none")
        .source("/sys")
        .options(vec![
            "rbind".to_string(),
            "nosuid".to_string(),
            "noexec".to_string(),
            "nodev".to_string(),
            "ro".to_string(),
        ])
        .build()?;

    let mut mounts: Vec<_> = spec
        .mounts()
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|m| !m.destination().starts_with(Path::new("/sys")))
        .collect();
    mounts.push(sys);
    spec.set_mounts(Some(mounts));

    if let Some(mut linux) = spec.linux().clone() {
        linux.set_resources(None);
        linux.set_cgroups_path(None);
        spec.set_linux(Some(linux));
    }

    // The process may not lower its OOM score below the runtime's own
    if let (Some(current), Some(mut process)) = (current_oom, spec.process().clone()) {
        if let Some(adj) = process.oom_score_adj() {
            if adj < current {
                process.set_oom_score_adj(Some(current));
                spec.set_process(Some(process));
            }
        }
    }

    tracing::debug!("converted spec for rootless execution");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{generate_spec, posix_base_spec, with_cgroup_parent};

    #[test]
    fn test_rootless_replaces_sysfs_and_cgroups() {
        let base = posix_base_spec(&["true".to_string()], &[], "/").unwrap();
        let mut spec = generate_spec(base, vec![with_cgroup_parent("builds", "abc")]).unwrap();

        convert(&mut spec, None).unwrap();

        let sys: Vec<_> = spec
            .mounts()
            .as_ref()
            .unwrap()
            .iter()
            .filter(|m| m.destination().starts_with("/sys"))
            .collect();
        assert_eq!(sys.len(), 1);
        assert_eq!(sys[0].source().as_deref(), Some(Path::new("/sys")));
        assert!(sys[0].options().as_ref().unwrap().contains(&"rbind".to_string()));

        let linux = spec.linux().as_ref().unwrap();
        assert!(linux.cgroups_path().is_none());
        assert!(linux.resources().is_none());
    }

    #[test]
    fn test_rootless_raises_oom_score() {
        let mut spec = posix_base_spec(&["true".to_string()], &[], "/").unwrap();
        let mut process = spec.process().clone().unwrap();
        process.set_oom_score_adj(Some(-500));
        spec.set_process(Some(process));

        convert(&mut spec, Some(100)).unwrap();
        assert_eq!(spec.process().as_ref().unwrap().oom_score_adj(), Some(100));
    }
}
