//! Deploy a payload that runs on a cron schedule.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use tracing::info;

use crate::cancel::CancelToken;
use crate::command;
use crate::error::Error;
use crate::exec::{self, StdinSource};
use crate::project::{ServiceEntry, ServiceKind};
use crate::rpc::ExecRequest;
use crate::{classify, payload};

/// The parsed `cron` invocation: target qualifier, payload path, the five
/// schedule fields, and the app args after `--`.
#[derive(Debug, PartialEq, Eq)]
pub struct CronInvocation {
    pub qualifier: String,
    pub payload: String,
    pub schedule: [String; 5],
    pub app_args: Vec<String>,
}

fn cron_field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Stars, numbers, ranges, lists, and step expressions.
    RE.get_or_init(|| {
        Regex::new(r"^(\*|\d+(-\d+)?)(/\d+)?(,(\*|\d+(-\d+)?)(/\d+)?)*$").expect("cron regex")
    })
}

/// Parse `service[@host] payload <schedule> [-- app-args]`. The schedule
/// may arrive as one quoted token holding all five fields or as five
/// separate tokens.
pub fn parse_args(args: &[String]) -> Result<CronInvocation, Error> {
    let usage = |reason: &str| Error::InvalidEndpoint {
        endpoint: "cron".to_string(),
        reason: reason.to_string(),
    };

    let (head, app_args) = match args.iter().position(|a| a == "--") {
        Some(idx) => (&args[..idx], args[idx + 1..].to_vec()),
        None => (args, Vec::new()),
    };

    let [qualifier, payload, schedule_tokens @ ..] = head else {
        return Err(usage("expected: cron service[@host] payload <schedule>"));
    };

    // One quoted token is split on whitespace into its fields.
    let fields: Vec<String> = if schedule_tokens.len() == 1 {
        schedule_tokens[0]
            .split_whitespace()
            .map(str::to_string)
            .collect()
    } else {
        schedule_tokens.to_vec()
    };

    let schedule: [String; 5] = fields.try_into().map_err(|fields: Vec<String>| {
        usage(&format!(
            "schedule needs exactly 5 fields, got {}",
            fields.len()
        ))
    })?;

    for field in &schedule {
        if !cron_field_regex().is_match(field) {
            return Err(usage(&format!("bad schedule field {field:?}")));
        }
    }

    Ok(CronInvocation {
        qualifier: qualifier.clone(),
        payload: payload.clone(),
        schedule,
        app_args,
    })
}

pub fn run(args: &[String]) -> Result<()> {
    let invocation = parse_args(args)?;
    let (target, mut project) = command::resolve_target(Some(&invocation.qualifier))?;

    let mut client = command::connect(&target.host)?;
    let host_info = client.info()?;
    let path = Path::new(&invocation.payload);
    let kind = classify::detect(path, &host_info.os, &host_info.arch)?;
    let encoded = payload::open(path, kind)?;
    let name = encoded.name().to_string();

    // The schedule fields ride in the arg list, app args right behind.
    let mut remote_args = vec!["cron".to_string()];
    remote_args.extend(invocation.schedule.iter().cloned());
    remote_args.extend(invocation.app_args.iter().cloned());
    info!(service = %target.service, schedule = %invocation.schedule.join(" "), "deploying cron service");

    let cancel = CancelToken::new();
    cancel.arm_ctrlc()?;
    exec::run(
        client,
        ExecRequest {
            service: target.service.clone(),
            args: remote_args,
            ..Default::default()
        },
        StdinSource::Payload(Box::new(encoded), name),
        &cancel,
    )?;

    project.set_entry(ServiceEntry {
        name: target.service.clone(),
        host: target.host.clone(),
        kind: ServiceKind::Cron,
        payload: project.relativize(path),
        env_file: None,
        schedule: Some(invocation.schedule.join(" ")),
        args: invocation.app_args,
    });
    project.save()?;
    println!("Scheduled {} on {}", target.service, target.host);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn quoted_schedule_splits_into_five_fields() {
        let inv = parse_args(&strings(&["svc-cron", "./bin", "0 9 15 * *", "--", "-live"]))
            .unwrap();
        assert_eq!(inv.qualifier, "svc-cron");
        assert_eq!(inv.payload, "./bin");
        assert_eq!(inv.schedule, ["0", "9", "15", "*", "*"]);
        assert_eq!(inv.app_args, vec!["-live"]);
    }

    #[test]
    fn separate_schedule_tokens_work_too() {
        let inv =
            parse_args(&strings(&["svc", "./bin", "*/5", "*", "*", "*", "1-5"])).unwrap();
        assert_eq!(inv.schedule, ["*/5", "*", "*", "*", "1-5"]);
        assert!(inv.app_args.is_empty());
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        let err = parse_args(&strings(&["svc", "./bin", "0 9 15 *"])).unwrap_err();
        assert!(err.to_string().contains("5 fields"));
        assert!(parse_args(&strings(&["svc", "./bin", "0", "9"])).is_err());
    }

    #[test]
    fn junk_fields_are_rejected() {
        assert!(parse_args(&strings(&["svc", "./bin", "0 9 15 * nope"])).is_err());
        assert!(parse_args(&strings(&["svc", "./bin", "@daily * * * *"])).is_err());
    }

    #[test]
    fn lists_ranges_and_steps_are_accepted() {
        let inv = parse_args(&strings(&["svc", "./bin", "0,30 8-18/2 * * 1,3,5"])).unwrap();
        assert_eq!(inv.schedule, ["0,30", "8-18/2", "*", "*", "1,3,5"]);
    }

    #[test]
    fn double_dash_separates_app_args_from_schedule() {
        let inv = parse_args(&strings(&[
            "svc", "./bin", "0", "9", "15", "*", "*", "--", "-live", "--fast",
        ]))
        .unwrap();
        assert_eq!(inv.app_args, vec!["-live", "--fast"]);
    }
}
