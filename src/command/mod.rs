pub mod copy;
pub mod cron;
pub mod docker;
pub mod env;
pub mod events;
pub mod forward;
pub mod info;
pub mod init_host;
pub mod list_hosts;
pub mod prefs;
pub mod remove;
pub mod run;
pub mod ssh;
pub mod stage;
pub mod status;

use anyhow::Result;

use crate::error::Error;
use crate::prefs::settings;
use crate::project::ProjectStore;
use crate::resolve::{self, Target};
use crate::rpc::RpcClient;

/// Dial the agent on `host` using the configured RPC port.
pub fn connect(host: &str) -> Result<RpcClient, Error> {
    RpcClient::connect(host, settings().rpc_port)
}

/// The only service name in the project, if there is exactly one.
/// Lets `yeet ssh` and friends omit the service in single-service
/// projects.
pub fn default_service(project: &ProjectStore) -> Option<String> {
    resolve::unique_service(project)
}

/// Resolve an optional `service[@host]` argument against flags, project
/// state, and preferences.
pub fn resolve_target(arg: Option<&str>) -> Result<(Target, ProjectStore)> {
    let project = ProjectStore::discover_cwd()?;
    let arg = match arg {
        Some(arg) => arg.to_string(),
        None => settings()
            .service_override
            .clone()
            .or_else(|| default_service(&project))
            .ok_or_else(|| Error::MissingService("(none given)".to_string()))?,
    };
    let target = resolve::target(&arg, settings(), &project)?;
    Ok((target, project))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{ServiceEntry, ServiceKind};
    use std::path::PathBuf;

    fn project_with(names: &[(&str, &str)]) -> ProjectStore {
        let mut project = ProjectStore::at(PathBuf::from("/tmp/yeet.toml"));
        for (name, host) in names {
            project.set_entry(ServiceEntry {
                name: name.to_string(),
                host: host.to_string(),
                kind: ServiceKind::Empty,
                payload: "p".to_string(),
                env_file: None,
                schedule: None,
                args: Vec::new(),
            });
        }
        project
    }

    #[test]
    fn single_service_is_the_default() {
        let project = project_with(&[("svc", "a"), ("svc", "b")]);
        assert_eq!(default_service(&project).as_deref(), Some("svc"));
    }

    #[test]
    fn multiple_services_have_no_default() {
        let project = project_with(&[("svc-a", "a"), ("svc-b", "a")]);
        assert_eq!(default_service(&project), None);
        assert_eq!(default_service(&project_with(&[])), None);
    }
}
