//! Rank and group size as assigned by the job launcher

use anyhow::{Context, anyhow};

// first match wins, our own variables take precedence over the launcher's
const RANK_VARS: &[&str] = &[
    "BCAST_RANK",
    "PMI_RANK",
    "PALS_RANKID",
    "OMPI_COMM_WORLD_RANK",
    "PMIX_RANK",
    "SLURM_PROCID",
];

const SIZE_VARS: &[&str] = &[
    "BCAST_WORLD_SIZE",
    "PMI_SIZE",
    "OMPI_COMM_WORLD_SIZE",
    "SLURM_NTASKS",
];

/// Position of this process within the group
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchInfo {
    pub rank: usize,
    pub world_size: usize,
}

fn lookup_first(
    lookup: &impl Fn(&str) -> Option<String>,
    names: &[&'static str],
) -> anyhow::Result<Option<(&'static str, usize)>> {
    for &name in names {
        if let Some(value) = lookup(name) {
            let parsed = value
                .trim()
                .parse::<usize>()
                .with_context(|| format!("invalid value {value:?} of {name}"))?;
            return Ok(Some((name, parsed)));
        }
    }
    Ok(None)
}

impl LaunchInfo {
    /// A group of one, used when no launcher variables are present
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::detect(|name| std::env::var(name).ok())
    }

    /// Detects rank and size through `lookup` (normally the process environment).
    pub fn detect(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let rank = lookup_first(&lookup, RANK_VARS)?;
        let size = lookup_first(&lookup, SIZE_VARS)?;
        let info = match (rank, size) {
            (None, None) => return Ok(Self::single()),
            (Some((_, rank)), Some((_, world_size))) => Self { rank, world_size },
            (Some((name, _)), None) => {
                return Err(anyhow!(
                    "{name} is set but the group size is unknown (set one of {})",
                    SIZE_VARS.join(", ")
                ));
            }
            (None, Some((name, _))) => {
                return Err(anyhow!(
                    "{name} is set but the rank is unknown (set one of {})",
                    RANK_VARS.join(", ")
                ));
            }
        };
        if info.world_size == 0 {
            return Err(anyhow!("group size must be at least 1"));
        }
        if info.rank >= info.world_size {
            return Err(anyhow!(
                "rank {} is out of range for a group of {}",
                info.rank,
                info.world_size
            ));
        }
        tracing::debug!("detected launch: {:?}", info);
        Ok(info)
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }
}

/// Picks the coordinator address: an explicit HOST:PORT wins, otherwise the first host of the
/// PBS node file (rank 0 runs there) on the default port.
pub fn resolve_coordinator(
    explicit: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Option<String>> {
    if let Some(address) = explicit {
        return Ok(Some(address.to_string()));
    }
    match lookup("PBS_NODEFILE") {
        Some(path) => Ok(Some(coordinator_from_nodefile(std::path::Path::new(&path))?)),
        None => Ok(None),
    }
}

pub fn coordinator_from_nodefile(path: &std::path::Path) -> anyhow::Result<String> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read node file {path:?}"))?;
    let host = contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("node file {path:?} lists no hosts"))?;
    Ok(format!("{}:{}", host, common::DEFAULT_COORDINATOR_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: std::collections::HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn no_launcher_means_group_of_one() {
        assert_eq!(LaunchInfo::detect(env(&[])).unwrap(), LaunchInfo::single());
        assert!(LaunchInfo::single().is_coordinator());
    }

    #[test]
    fn explicit_variables_win_over_launcher() {
        let info = LaunchInfo::detect(env(&[
            ("BCAST_RANK", "2"),
            ("BCAST_WORLD_SIZE", "4"),
            ("PMI_RANK", "0"),
            ("PMI_SIZE", "16"),
        ]))
        .unwrap();
        assert_eq!(
            info,
            LaunchInfo {
                rank: 2,
                world_size: 4
            }
        );
        assert!(!info.is_coordinator());
    }

    #[test]
    fn launcher_variables_are_recognized() {
        let pals = LaunchInfo::detect(env(&[("PALS_RANKID", "5"), ("PMI_SIZE", "6")])).unwrap();
        assert_eq!(pals.rank, 5);
        assert_eq!(pals.world_size, 6);
        let slurm =
            LaunchInfo::detect(env(&[("SLURM_PROCID", "0"), ("SLURM_NTASKS", "3")])).unwrap();
        assert!(slurm.is_coordinator());
        assert_eq!(slurm.world_size, 3);
    }

    #[test]
    fn inconsistent_variables_are_rejected() {
        assert!(LaunchInfo::detect(env(&[("PMI_RANK", "1")])).is_err());
        assert!(LaunchInfo::detect(env(&[("PMI_SIZE", "4")])).is_err());
        assert!(LaunchInfo::detect(env(&[("PMI_RANK", "4"), ("PMI_SIZE", "4")])).is_err());
        assert!(LaunchInfo::detect(env(&[("PMI_RANK", "0"), ("PMI_SIZE", "0")])).is_err());
        let error = LaunchInfo::detect(env(&[("PMI_RANK", "one"), ("PMI_SIZE", "4")]))
            .unwrap_err();
        assert!(format!("{error:#}").contains("PMI_RANK"));
    }

    #[test]
    fn explicit_coordinator_wins() {
        let address =
            resolve_coordinator(Some("node7:4000"), env(&[("PBS_NODEFILE", "/nonexistent")]))
                .unwrap();
        assert_eq!(address.as_deref(), Some("node7:4000"));
        assert_eq!(resolve_coordinator(None, env(&[])).unwrap(), None);
    }

    #[test]
    fn coordinator_is_first_host_of_nodefile() {
        let dir = tempfile::tempdir().unwrap();
        let nodefile = dir.path().join("nodefile");
        std::fs::write(&nodefile, "\nx1000c0s0b0n0\nx1000c0s0b0n1\n").unwrap();
        let address = resolve_coordinator(
            None,
            env(&[("PBS_NODEFILE", nodefile.to_str().unwrap())]),
        )
        .unwrap();
        assert_eq!(address, Some(format!("x1000c0s0b0n0:{}", common::DEFAULT_COORDINATOR_PORT)));
        std::fs::write(&nodefile, "\n\n").unwrap();
        assert!(coordinator_from_nodefile(&nodefile).is_err());
    }
}
