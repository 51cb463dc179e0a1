//! Sectioned report combining host facts, remote service state, and the
//! local project's view of the payload.

use std::path::Path;

use anyhow::Result;
use console::style;
use serde_json::json;

use crate::classify;
use crate::command;
use crate::command::status::OutputFormat;
use crate::project::ServiceEntry;
use crate::rpc::{HostInfo, ServiceInfoResponse};

pub fn run(service: Option<&str>, format: OutputFormat) -> Result<()> {
    let (target, project) = command::resolve_target(service)?;

    let mut client = command::connect(&target.host)?;
    let host_info = client.info()?;
    let service_info = client.service_info(&target.service)?;

    let entry = project.get(&target.service, &target.host).cloned();
    let local_kind = entry.as_ref().and_then(|e| {
        let path = project.dir().join(&e.payload);
        classify::detect(&path, &host_info.os, &host_info.arch)
            .ok()
            .map(|k| k.to_string())
    });

    match format {
        OutputFormat::Json | OutputFormat::JsonPretty => {
            let doc = json!({
                "host": host_info,
                "service": service_info,
                "local": {
                    "entry": entry,
                    "payloadKind": local_kind,
                },
            });
            if format == OutputFormat::Json {
                println!("{doc}");
            } else {
                println!("{}", serde_json::to_string_pretty(&doc)?);
            }
        }
        OutputFormat::Table => {
            print_report(
                &target.service,
                &host_info,
                &service_info,
                entry.as_ref(),
                local_kind.as_deref(),
            );
        }
    }
    Ok(())
}

fn section(title: &str) {
    println!("{}", style(title).bold());
}

fn field(name: &str, value: impl std::fmt::Display) {
    println!("  {name}: {value}");
}

fn print_report(
    service: &str,
    host: &HostInfo,
    info: &ServiceInfoResponse,
    entry: Option<&ServiceEntry>,
    local_kind: Option<&str>,
) {
    section("Host");
    field("hostname", &host.hostname);
    field("platform", format!("{}/{}", host.os, host.arch));
    field("agent", &host.version);
    if !host.tags.is_empty() {
        field("tags", host.tags.join(","));
    }

    println!();
    section(&format!("Service {service}"));
    if !info.found {
        field("state", "not installed");
    } else {
        field("type", &info.data_type);
        field("generation", info.generation);
        if info.staged {
            field("staged", "yes");
        }
        if !info.paths.root.is_empty() {
            field("root", &info.paths.root);
        }
        if !info.images.is_empty() {
            field("images", info.images.join(", "));
        }
    }

    if info.network.tailscale.is_some()
        || info.network.macvlan.is_some()
        || !info.network.service_ips.is_empty()
    {
        println!();
        section("Network");
        if let Some(ts) = &info.network.tailscale {
            field("tailscale", format!("{} ({})", ts.hostname, ts.ips.join(", ")));
            if !ts.tags.is_empty() {
                field("ts-tags", ts.tags.join(","));
            }
        }
        if let Some(mv) = &info.network.macvlan {
            field("macvlan", render_macvlan(mv));
        }
        if !info.network.service_ips.is_empty() {
            field("service-ips", info.network.service_ips.join(", "));
        }
    }

    if !info.components.is_empty() {
        println!();
        section("Components");
        for c in &info.components {
            println!("  {} ({}): {}", c.name, c.container, c.status);
        }
    }

    println!();
    section("Local");
    match entry {
        Some(entry) => {
            field("payload", &entry.payload);
            if let Some(kind) = local_kind {
                field("kind", kind);
            }
            if let Some(schedule) = &entry.schedule {
                field("schedule", schedule);
            }
            if let Some(env) = &entry.env_file {
                field("env-file", env);
            }
            if !entry.args.is_empty() {
                field("args", entry.args.join(" "));
            }
        }
        None => field("entry", "none in yeet.toml"),
    }
}

/// A vlan of 0 means unset and is suppressed.
fn render_macvlan(mv: &crate::rpc::MacvlanInfo) -> String {
    let mut out = format!("{} {}", mv.parent, mv.address);
    if mv.vlan != 0 {
        out.push_str(&format!(" vlan {}", mv.vlan));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::MacvlanInfo;

    #[test]
    fn macvlan_vlan_zero_is_suppressed() {
        let mv = MacvlanInfo {
            parent: "eth0".into(),
            vlan: 0,
            address: "192.168.1.40".into(),
        };
        assert_eq!(render_macvlan(&mv), "eth0 192.168.1.40");

        let tagged = MacvlanInfo {
            parent: "eth0".into(),
            vlan: 40,
            address: "192.168.40.2".into(),
        };
        assert_eq!(render_macvlan(&tagged), "eth0 192.168.40.2 vlan 40");
    }
}
