//! Enumerate candidate hosts and their agent-reported tags.

use std::collections::BTreeSet;

use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};
use tracing::debug;

use crate::command;
use crate::prefs::{ENV_HOST, settings};
use crate::project::ProjectStore;

#[derive(Tabled)]
struct HostRow {
    #[tabled(rename = "HOST")]
    host: String,
    #[tabled(rename = "AGENT")]
    agent: String,
    #[tabled(rename = "TAGS")]
    tags: String,
}

/// Union of project-file hosts, the preferences default, and the
/// environment override.
fn candidate_hosts(project: &ProjectStore) -> Vec<String> {
    let mut hosts = BTreeSet::new();
    hosts.extend(project.config.hosts.iter().cloned());
    hosts.extend(project.config.entries.iter().map(|e| e.host.clone()));
    hosts.insert(settings().default_host.clone());
    if let Ok(env_host) = std::env::var(ENV_HOST)
        && !env_host.is_empty()
    {
        hosts.insert(env_host);
    }
    hosts.into_iter().collect()
}

/// Does the host carry every wanted tag?
fn matches_tags(host_tags: &[String], wanted: &[&str]) -> bool {
    wanted.iter().all(|w| host_tags.iter().any(|t| t == w))
}

pub fn run(tags: Option<&str>) -> Result<()> {
    let project = ProjectStore::discover_cwd()?;
    let wanted: Vec<&str> = tags
        .map(|t| t.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let mut rows = Vec::new();
    for host in candidate_hosts(&project) {
        // Listing is a discovery aid; unreachable hosts still show up.
        match command::connect(&host).and_then(|mut c| c.info()) {
            Ok(info) => {
                if !matches_tags(&info.tags, &wanted) {
                    continue;
                }
                rows.push(HostRow {
                    host,
                    agent: info.version,
                    tags: if info.tags.is_empty() {
                        "-".to_string()
                    } else {
                        info.tags.join(",")
                    },
                });
            }
            Err(e) => {
                debug!(host, error = %e, "host did not answer");
                if wanted.is_empty() {
                    rows.push(HostRow {
                        host,
                        agent: "unreachable".to_string(),
                        tags: "-".to_string(),
                    });
                }
            }
        }
    }

    if rows.is_empty() {
        println!("No hosts found");
        return Ok(());
    }

    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..3), Padding::new(0, 1, 0, 0));
    println!("{table}");
    Ok(())
}
