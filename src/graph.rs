//! Dependency Graph Resolver
//!
//! Orders services into startup waves. Every service in a wave depends only on
//! services from earlier waves, so members of one wave may start concurrently.

use crate::error::{Error, Result};
use crate::service::ServiceSpec;
use std::collections::{HashMap, HashSet};

/// Startup waves, first wave first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StartupPlan {
    pub waves: Vec<Vec<String>>,
}

impl StartupPlan {
    pub fn service_count(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    /// Flattened start order.
    pub fn start_order(&self) -> Vec<String> {
        self.waves.iter().flatten().cloned().collect()
    }

    /// Reverse dependency order, used for teardown.
    pub fn teardown_order(&self) -> Vec<String> {
        self.waves
            .iter()
            .rev()
            .flat_map(|wave| wave.iter().rev())
            .cloned()
            .collect()
    }

    /// Index of the wave containing `name`.
    pub fn wave_of(&self, name: &str) -> Option<usize> {
        self.waves
            .iter()
            .position(|wave| wave.iter().any(|member| member == name))
    }
}

pub struct DependencyGraph {
    /// Declaration order, kept so plans are deterministic.
    nodes: Vec<String>,
    deps: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph, rejecting duplicate names and unknown references.
    pub fn from_specs(specs: &[ServiceSpec]) -> Result<Self> {
        let mut nodes = Vec::with_capacity(specs.len());
        let mut deps = HashMap::with_capacity(specs.len());

        for spec in specs {
            if deps.contains_key(&spec.name) {
                return Err(Error::DuplicateService(spec.name.clone()));
            }
            nodes.push(spec.name.clone());
            deps.insert(spec.name.clone(), spec.depends_on.clone());
        }

        for spec in specs {
            for dep in &spec.depends_on {
                if !deps.contains_key(dep) {
                    return Err(Error::UnknownService {
                        referrer: format!("service '{}'", spec.name),
                        reference: dep.clone(),
                    });
                }
            }
        }

        Ok(Self { nodes, deps })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.deps.contains_key(name)
    }

    /// Repeatedly peel off the services whose dependencies are all placed.
    pub fn resolve(&self) -> Result<StartupPlan> {
        let mut placed: HashSet<&str> = HashSet::with_capacity(self.nodes.len());
        let mut waves = Vec::new();

        while placed.len() < self.nodes.len() {
            let wave: Vec<&String> = self
                .nodes
                .iter()
                .filter(|node| !placed.contains(node.as_str()))
                .filter(|node| {
                    self.deps[node.as_str()]
                        .iter()
                        .all(|dep| placed.contains(dep.as_str()))
                })
                .collect();

            if wave.is_empty() {
                return Err(Error::DependencyCycle {
                    cycle: self.describe_cycle(&placed),
                });
            }

            placed.extend(wave.iter().map(|node| node.as_str()));
            waves.push(wave.into_iter().cloned().collect());
        }

        Ok(StartupPlan { waves })
    }

    /// Walk unplaced nodes until one repeats, yielding e.g. `a -> b -> a`.
    fn describe_cycle(&self, placed: &HashSet<&str>) -> String {
        let Some(start) = self
            .nodes
            .iter()
            .find(|node| !placed.contains(node.as_str()))
        else {
            return "unknown".to_string();
        };

        let mut path: Vec<&str> = vec![start.as_str()];
        let mut current = start.as_str();
        loop {
            let next = self.deps[current]
                .iter()
                .map(String::as_str)
                .find(|dep| !placed.contains(dep));
            let Some(next) = next else {
                break;
            };
            if let Some(pos) = path.iter().position(|seen| *seen == next) {
                let mut cycle: Vec<&str> = path[pos..].to_vec();
                cycle.push(next);
                return cycle.join(" -> ");
            }
            path.push(next);
            current = next;
        }
        path.join(" -> ")
    }
}

/// Validate and order `specs` in one step.
pub fn resolve_waves(specs: &[ServiceSpec]) -> Result<StartupPlan> {
    DependencyGraph::from_specs(specs)?.resolve()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, deps: &[&str]) -> ServiceSpec {
        ServiceSpec::external(name).depends_on(deps)
    }

    #[test]
    fn independent_services_share_a_wave() {
        let plan = resolve_waves(&[
            spec("db", &[]),
            spec("cache", &[]),
            spec("gateway", &["db", "cache"]),
        ])
        .unwrap();

        assert_eq!(
            plan.waves,
            vec![
                vec!["db".to_string(), "cache".to_string()],
                vec!["gateway".to_string()]
            ]
        );
        assert_eq!(plan.teardown_order(), vec!["gateway", "cache", "db"]);
        assert_eq!(plan.wave_of("gateway"), Some(1));
    }

    #[test]
    fn chain_produces_one_wave_per_level() {
        let plan = resolve_waves(&[
            spec("api", &["cache"]),
            spec("cache", &["db"]),
            spec("db", &[]),
        ])
        .unwrap();
        assert_eq!(plan.start_order(), vec!["db", "cache", "api"]);
        assert_eq!(plan.waves.len(), 3);
    }

    #[test]
    fn cycle_is_a_config_error() {
        let err = resolve_waves(&[
            spec("a", &["b"]),
            spec("b", &["c"]),
            spec("c", &["a"]),
            spec("d", &[]),
        ])
        .unwrap_err();

        match &err {
            Error::DependencyCycle { cycle } => {
                assert!(cycle.contains("a -> b -> c -> a"), "{cycle}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_config());
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = resolve_waves(&[spec("solo", &["solo"])]).unwrap_err();
        assert!(matches!(err, Error::DependencyCycle { .. }));
    }

    #[test]
    fn unknown_reference_is_rejected() {
        let err = resolve_waves(&[spec("gateway", &["db"])]).unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownService { ref reference, .. } if reference == "db"
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = resolve_waves(&[spec("db", &[]), spec("db", &[])]).unwrap_err();
        assert!(matches!(err, Error::DuplicateService(_)));
    }

    #[test]
    fn empty_input_is_an_empty_plan() {
        let plan = resolve_waves(&[]).unwrap();
        assert_eq!(plan.service_count(), 0);
        assert!(plan.teardown_order().is_empty());
    }
}
