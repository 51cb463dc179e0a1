//! Host resolution: decide which host a service operation targets.

use crate::error::Error;
use crate::prefs::Settings;
use crate::project::ProjectStore;

/// A `service[@host]` qualifier, split on the final `@` so service names
/// containing `@` still work.
pub fn split_qualifier(arg: &str) -> (&str, Option<&str>) {
    match arg.rfind('@') {
        Some(idx) => (&arg[..idx], Some(&arg[idx + 1..])),
        None => (arg, None),
    }
}

/// A resolved target: the service name and the host that will serve it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub service: String,
    pub host: String,
}

/// Pick a host. Precedence, highest first: explicit qualifier, `--host`
/// pin, `CATCH_HOST`, a single known host from project state, the
/// preferences/default chain. Multiple known hosts with no pin is an
/// error listing the candidates.
pub fn pick_host(
    service: &str,
    qualifier_host: Option<&str>,
    host_flag: Option<&str>,
    env_host: Option<&str>,
    fallback_host: &str,
    known_hosts: &[String],
) -> Result<String, Error> {
    if let Some(host) = qualifier_host.filter(|h| !h.is_empty()) {
        return Ok(host.to_string());
    }
    if let Some(host) = host_flag.filter(|h| !h.is_empty()) {
        return Ok(host.to_string());
    }
    if let Some(host) = env_host.filter(|h| !h.is_empty()) {
        return Ok(host.to_string());
    }
    match known_hosts {
        [only] => Ok(only.clone()),
        [] => Ok(fallback_host.to_string()),
        many => Err(Error::AmbiguousHost {
            service: service.to_string(),
            candidates: many.to_vec(),
        }),
    }
}

/// The only service name in the project, if there is exactly one.
pub fn unique_service(project: &ProjectStore) -> Option<String> {
    let mut names: Vec<&str> = project
        .config
        .entries
        .iter()
        .map(|e| e.name.as_str())
        .collect();
    names.sort_unstable();
    names.dedup();
    match names.as_slice() {
        [only] => Some((*only).to_string()),
        _ => None,
    }
}

/// Resolve a `service[@host]` argument against settings and project state.
pub fn target(
    arg: &str,
    settings: &Settings,
    project: &ProjectStore,
) -> Result<Target, Error> {
    let (service, qualifier_host) = split_qualifier(arg);
    let service = if service.is_empty() {
        settings
            .service_override
            .clone()
            .or_else(|| unique_service(project))
            .ok_or_else(|| Error::MissingService("(none given)".to_string()))?
    } else {
        service.to_string()
    };

    let known = project.hosts_for(&service);
    let host = pick_host(
        &service,
        qualifier_host,
        settings.host_override.as_deref(),
        std::env::var(crate::prefs::ENV_HOST).ok().as_deref(),
        &settings.default_host,
        &known,
    )?;

    Ok(Target { service, host })
}
