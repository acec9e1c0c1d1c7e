//! Log stream ingestion
//!
//! One long-lived GraphQL-over-WebSocket subscription per monitoring
//! target, driven by a pure connection state machine and supervised by a
//! keyed task manager.

pub mod frame;
pub mod machine;
mod subscription;
mod supervisor;

pub use subscription::{ConnectionHealth, SubscriptionHandle, SubscriptionSettings};
pub use supervisor::{ConnectionSnapshot, SubscriptionSupervisor};

use crate::config::RailwayConfig;

/// `(project, environment, service?)` tuple identifying one subscription.
/// An empty service means "all services in the environment".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MonitoringTarget {
    pub project_id: String,
    pub environment_id: String,
    pub service_id: Option<String>,
    pub service_name: Option<String>,
}

impl MonitoringTarget {
    /// Stable key for supervisor maps and log fields
    pub fn key(&self) -> String {
        match &self.service_id {
            Some(service) => format!(
                "{}:{}:{}",
                self.project_id, self.environment_id, service
            ),
            None => format!("{}:{}", self.project_id, self.environment_id),
        }
    }
}

/// Cartesian expansion of the configured projects x environments x services.
pub fn expand_targets(config: &RailwayConfig) -> Vec<MonitoringTarget> {
    let mut targets = Vec::new();
    for project in &config.projects {
        for environment in &config.environments {
            if config.services.is_empty() {
                targets.push(MonitoringTarget {
                    project_id: project.clone(),
                    environment_id: environment.clone(),
                    service_id: None,
                    service_name: None,
                });
            } else {
                for service in &config.services {
                    targets.push(MonitoringTarget {
                        project_id: project.clone(),
                        environment_id: environment.clone(),
                        service_id: Some(service.clone()),
                        service_name: None,
                    });
                }
            }
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_targets_cartesian() {
        let config = RailwayConfig {
            api_token: Some("tok".into()),
            projects: vec!["p1".into(), "p2".into()],
            environments: vec!["production".into()],
            services: vec!["s1".into(), "s2".into()],
        };
        let targets = expand_targets(&config);
        assert_eq!(targets.len(), 4);
        assert!(targets
            .iter()
            .all(|t| t.environment_id == "production" && t.service_id.is_some()));
    }

    #[test]
    fn test_expand_targets_empty_services_means_whole_env() {
        let config = RailwayConfig {
            api_token: Some("tok".into()),
            projects: vec!["p1".into()],
            environments: vec!["production".into(), "staging".into()],
            services: vec![],
        };
        let targets = expand_targets(&config);
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| t.service_id.is_none()));
    }

    #[test]
    fn test_target_key_is_stable() {
        let target = MonitoringTarget {
            project_id: "p".into(),
            environment_id: "e".into(),
            service_id: Some("s".into()),
            service_name: None,
        };
        assert_eq!(target.key(), "p:e:s");
    }
}
