//! Dependency ordering of service definitions.
//!
//! A service depends on another when the other's name appears in its `links`,
//! `depends_on` or `volumes_from`, or when its `pid` mode is `service:<other>`.
//! [`sort_services`] returns the services so that each one comes after everything it
//! depends on, using a depth-first, mark-based topological sort.
use std::collections::{HashMap, HashSet};

use crate::{config::ServiceSpec, error::DependencyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unmarked,
    Temporary,
    Permanent,
}

struct Graph<'a> {
    services: &'a [ServiceSpec],
    /// `dependents[i]` lists the services that reference service `i`, in input order.
    dependents: Vec<Vec<usize>>,
    marks: Vec<Mark>,
    /// Services currently being visited, outermost first.
    ancestors: Vec<usize>,
    sorted: Vec<usize>,
}

impl<'a> Graph<'a> {
    fn build(services: &'a [ServiceSpec]) -> Result<Self, DependencyError> {
        let index: HashMap<&str, usize> = services
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        let mut dependents = vec![Vec::new(); services.len()];
        let mut seen = HashSet::new();
        for (dependent, service) in services.iter().enumerate() {
            for dependency in service.dependency_names() {
                let Some(&target) = index.get(dependency) else {
                    return Err(DependencyError::UnknownService {
                        service: service.name.clone(),
                        dependency: dependency.to_string(),
                    });
                };
                if seen.insert((target, dependent)) {
                    dependents[target].push(dependent);
                }
            }
        }

        Ok(Self {
            services,
            dependents,
            marks: vec![Mark::Unmarked; services.len()],
            ancestors: Vec::new(),
            sorted: Vec::with_capacity(services.len()),
        })
    }

    fn visit(&mut self, node: usize) -> Result<(), DependencyError> {
        match self.marks[node] {
            Mark::Permanent => Ok(()),
            Mark::Temporary => Err(self.cycle_error(node)),
            Mark::Unmarked => {
                self.marks[node] = Mark::Temporary;
                self.ancestors.push(node);

                for i in 0..self.dependents[node].len() {
                    let dependent = self.dependents[node][i];
                    self.visit(dependent)?;
                }

                self.ancestors.pop();
                self.marks[node] = Mark::Permanent;
                self.sorted.push(node);
                Ok(())
            }
        }
    }

    fn cycle_error(&self, node: usize) -> DependencyError {
        let service = &self.services[node];
        let name = service.name.as_str();

        if service.link_targets().contains(&name) {
            return DependencyError::SelfLink(name.to_string());
        }
        if service.volume_sources().contains(&name) {
            return DependencyError::SelfVolume(name.to_string());
        }
        if service.depends_on.iter().any(|d| d == name) {
            return DependencyError::SelfDependsOn(name.to_string());
        }

        DependencyError::Circular {
            ancestors: self
                .ancestors
                .iter()
                .map(|&i| self.services[i].name.clone())
                .collect(),
        }
    }
}

/// Orders services so that every service appears after all services it depends on.
///
/// Roots are taken from the end of the not-yet-visited services and each finished
/// service is placed in front of everything emitted so far, so services without a
/// relation to each other keep their input order. A reference to an undefined service
/// is an [`DependencyError::UnknownService`].
pub fn sort_services(services: &[ServiceSpec]) -> Result<Vec<ServiceSpec>, DependencyError> {
    let mut graph = Graph::build(services)?;

    while let Some(root) = (0..services.len())
        .rev()
        .find(|&i| graph.marks[i] == Mark::Unmarked)
    {
        graph.visit(root)?;
    }

    // `sorted` holds nodes in finishing order; front insertion is a reversal.
    Ok(graph
        .sorted
        .iter()
        .rev()
        .map(|&i| services[i].clone())
        .collect())
}
