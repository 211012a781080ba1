//! Project lookup - resource key to container identity and connection params

use devyard_foundation::{DevyardConfig, Error, ProjectConfig, Result, SshConfig};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Everything the runtime needs to reach one project's container
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectTarget {
    pub key: String,
    pub container: String,
    pub compose_file: Option<PathBuf>,
    pub workdir: Option<String>,
    pub ssh: Option<SshTarget>,
}

/// SSH parameters for shells reached over the network
#[derive(Debug, Clone, PartialEq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
}

impl From<&SshConfig> for SshTarget {
    fn from(ssh: &SshConfig) -> Self {
        Self {
            host: ssh.host.clone(),
            port: ssh.port,
            user: ssh.user.clone(),
            identity_file: ssh.identity_file.clone(),
        }
    }
}

impl ProjectTarget {
    pub fn new(key: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            container: container.into(),
            compose_file: None,
            workdir: None,
            ssh: None,
        }
    }

    fn from_config(key: &str, project: &ProjectConfig) -> Self {
        Self {
            key: key.to_string(),
            container: project.container.clone(),
            compose_file: project.compose_file.clone(),
            workdir: project.workdir.clone(),
            ssh: project.ssh.as_ref().map(SshTarget::from),
        }
    }
}

/// Resolves resource keys
pub trait ProjectLookup: Send + Sync {
    fn resolve(&self, key: &str) -> Result<ProjectTarget>;
}

/// Lookup backed by the `projects` section of the config
#[derive(Debug, Clone, Default)]
pub struct StaticProjects {
    projects: BTreeMap<String, ProjectTarget>,
}

impl StaticProjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &DevyardConfig) -> Self {
        let projects = config
            .projects
            .iter()
            .map(|(key, project)| (key.clone(), ProjectTarget::from_config(key, project)))
            .collect();
        Self { projects }
    }

    pub fn with(mut self, target: ProjectTarget) -> Self {
        self.projects.insert(target.key.clone(), target);
        self
    }
}

impl ProjectLookup for StaticProjects {
    fn resolve(&self, key: &str) -> Result<ProjectTarget> {
        self.projects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found("project", key))
    }
}
