//! Service status, across one host or fanned out over all of them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Result;
use clap::ValueEnum;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};
use tracing::debug;

use crate::command;
use crate::prefs::settings;
use crate::project::ProjectStore;
use crate::rpc::{ComponentStatus, StatusReport};

/// Output shape shared by `status` and `info`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    JsonPretty,
}

/// Width budget for the Containers column.
const CONTAINERS_WIDTH: usize = 32;

/// Bound on concurrent host queries during fan-out.
const FANOUT_WORKERS: usize = 4;

#[derive(Tabled)]
struct SingleHostRow {
    #[tabled(rename = "SERVICE")]
    service: String,
    #[tabled(rename = "CONTAINER")]
    container: String,
    #[tabled(rename = "STATUS")]
    status: String,
}

#[derive(Tabled)]
struct MultiHostRow {
    #[tabled(rename = "SERVICE")]
    service: String,
    #[tabled(rename = "HOST")]
    host: String,
    #[tabled(rename = "CONTAINERS")]
    containers: String,
    #[tabled(rename = "STATUS")]
    status: String,
}

/// Aggregate component states for a compose service: `running (N)` when
/// all run, `stopped (N)` when none do, `partial (R/N)` otherwise.
pub fn aggregate(components: &[ComponentStatus]) -> String {
    let total = components.len();
    let running = components
        .iter()
        .filter(|c| c.status == "running")
        .count();
    if total == 0 {
        "-".to_string()
    } else if running == total {
        format!("running ({total})")
    } else if running == 0 {
        format!("stopped ({total})")
    } else {
        format!("partial ({running}/{total})")
    }
}

/// Join container names, truncating to the column budget with an
/// ellipsis.
pub fn containers_column(components: &[ComponentStatus]) -> String {
    let joined = components
        .iter()
        .map(|c| c.container.as_str())
        .collect::<Vec<_>>()
        .join(",");
    truncate_with_ellipsis(&joined, CONTAINERS_WIDTH)
}

fn truncate_with_ellipsis(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let mut out: String = s.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Which hosts this status invocation covers.
fn relevant_hosts(project: &ProjectStore) -> Vec<String> {
    if let Some(host) = &settings().host_override {
        return vec![host.clone()];
    }
    let mut hosts = project.config.hosts.clone();
    hosts.extend(project.config.entries.iter().map(|e| e.host.clone()));
    hosts.sort();
    hosts.dedup();
    if hosts.is_empty() {
        hosts.push(settings().default_host.clone());
    }
    hosts
}

fn fetch_status(host: &str) -> Result<StatusReport> {
    let mut client = command::connect(host)?;
    Ok(client.status()?)
}

/// Query every host with bounded concurrency. Results come back
/// unordered; a single failure aborts the whole batch.
fn fan_out(hosts: &[String]) -> Result<BTreeMap<String, StatusReport>> {
    let queue = Arc::new(Mutex::new(hosts.to_vec()));
    let (tx, rx) = std::sync::mpsc::channel();

    let workers = FANOUT_WORKERS.min(hosts.len()).max(1);
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let queue = Arc::clone(&queue);
        let tx = tx.clone();
        handles.push(thread::spawn(move || {
            loop {
                let host = {
                    let mut q = queue.lock().expect("fan-out queue poisoned");
                    q.pop()
                };
                let Some(host) = host else { break };
                debug!(%host, "querying status");
                let result = fetch_status(&host).map(|r| (host.clone(), r));
                if tx.send(result).is_err() {
                    break;
                }
            }
        }));
    }
    drop(tx);

    let mut results = BTreeMap::new();
    for outcome in rx {
        match outcome {
            Ok((host, report)) => {
                results.insert(host, report);
            }
            Err(e) => {
                // Abort the batch; remaining workers stop when their send
                // fails or the queue drains.
                for handle in handles {
                    let _ = handle.join();
                }
                return Err(e);
            }
        }
    }
    for handle in handles {
        let _ = handle.join();
    }
    Ok(results)
}

fn render_single_host(report: &StatusReport) -> String {
    let mut rows: Vec<SingleHostRow> = report
        .services
        .iter()
        .flat_map(|service| {
            if service.components.is_empty() {
                vec![SingleHostRow {
                    service: service.name.clone(),
                    container: "-".to_string(),
                    status: "-".to_string(),
                }]
            } else {
                // Compose components are listed verbatim here.
                service
                    .components
                    .iter()
                    .map(|c| SingleHostRow {
                        service: service.name.clone(),
                        container: c.container.clone(),
                        status: c.status.clone(),
                    })
                    .collect()
            }
        })
        .collect();
    rows.sort_by(|a, b| {
        (&a.service, &a.container, &a.status).cmp(&(&b.service, &b.container, &b.status))
    });

    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..3), Padding::new(0, 1, 0, 0));
    table.to_string()
}

fn render_multi_host(results: &BTreeMap<String, StatusReport>) -> String {
    let mut rows: Vec<MultiHostRow> = results
        .iter()
        .flat_map(|(host, report)| {
            report.services.iter().map(|service| MultiHostRow {
                service: service.name.clone(),
                host: host.clone(),
                containers: containers_column(&service.components),
                status: aggregate(&service.components),
            })
        })
        .collect();
    rows.sort_by(|a, b| {
        (&a.service, &a.host, &a.containers, &a.status)
            .cmp(&(&b.service, &b.host, &b.containers, &b.status))
    });

    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..4), Padding::new(0, 1, 0, 0));
    table.to_string()
}

pub fn run(format: OutputFormat) -> Result<()> {
    let project = ProjectStore::discover_cwd()?;
    let hosts = relevant_hosts(&project);

    let results = if hosts.len() == 1 {
        let mut single = BTreeMap::new();
        single.insert(hosts[0].clone(), fetch_status(&hosts[0])?);
        single
    } else {
        fan_out(&hosts)?
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&results)?),
        OutputFormat::JsonPretty => println!("{}", serde_json::to_string_pretty(&results)?),
        OutputFormat::Table => {
            if results.len() == 1 {
                let report = results.values().next().expect("one result");
                if report.services.is_empty() {
                    println!("No services");
                } else {
                    println!("{}", render_single_host(report));
                }
            } else {
                println!("{}", render_multi_host(&results));
            }
        }
    }
    Ok(())
}
