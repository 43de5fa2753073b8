use crate::core::error::{EngineError, Result};
use crate::infra::pools::Tristate;
use std::env;

/// Settings read from `LOCALGEN_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEnv {
    pub clusters: usize,
    pub threads_per_cluster: usize,
    pub spin: Tristate,
    pub log_filter: String,
}

impl EngineEnv {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let clusters = parse_count(&lookup, "LOCALGEN_CLUSTERS")?.unwrap_or(1);
        let threads_per_cluster = parse_count(&lookup, "LOCALGEN_THREADS_PER_CLUSTER")?
            .unwrap_or_else(|| (cores / clusters).max(1));
        let spin = match lookup("LOCALGEN_SPIN") {
            Some(value) => value.parse()?,
            None => Tristate::Default,
        };
        let log_filter = lookup("LOCALGEN_LOG").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            clusters,
            threads_per_cluster,
            spin,
            log_filter,
        })
    }
}

impl Default for EngineEnv {
    fn default() -> Self {
        Self::from_lookup(|_| None).unwrap_or(Self {
            clusters: 1,
            threads_per_cluster: 1,
            spin: Tristate::Default,
            log_filter: "info".to_string(),
        })
    }
}

fn parse_count<F>(lookup: &F, key: &str) -> Result<Option<usize>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => match value.trim().parse::<usize>() {
            Ok(n) if n > 0 => Ok(Some(n)),
            _ => Err(EngineError::Config(format!("{key} must be a positive integer, got {value:?}"))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(vars: &[(&str, &str)]) -> Result<EngineEnv> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        EngineEnv::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let env = env_of(&[]).unwrap();
        assert_eq!(env.clusters, 1);
        assert!(env.threads_per_cluster >= 1);
        assert_eq!(env.spin, Tristate::Default);
        assert_eq!(env.log_filter, "info");
    }

    #[test]
    fn test_overrides() {
        let env = env_of(&[
            ("LOCALGEN_CLUSTERS", "2"),
            ("LOCALGEN_THREADS_PER_CLUSTER", "3"),
            ("LOCALGEN_SPIN", "on"),
            ("LOCALGEN_LOG", "localgen=debug"),
        ])
        .unwrap();
        assert_eq!((env.clusters, env.threads_per_cluster), (2, 3));
        assert_eq!(env.spin, Tristate::True);
        assert_eq!(env.log_filter, "localgen=debug");
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(env_of(&[("LOCALGEN_CLUSTERS", "0")]), Err(EngineError::Config(_))));
        assert!(env_of(&[("LOCALGEN_SPIN", "maybe")]).is_err());
    }
}
