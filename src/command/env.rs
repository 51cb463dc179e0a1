//! Service environment management: show, edit, copy, set.

use std::fs::File;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use tracing::info;

use crate::cancel::CancelToken;
use crate::command;
use crate::error::Error;
use crate::exec::{self, StdinSource};
use crate::rpc::ExecRequest;

fn key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env key regex"))
}

/// Validate and normalize KEY=VALUE tokens: bad keys are rejected,
/// duplicate keys keep the last value, first-seen order is preserved.
pub fn normalize_assignments(tokens: &[String]) -> Result<Vec<String>, Error> {
    let mut order: Vec<String> = Vec::new();
    let mut values: std::collections::HashMap<String, String> = std::collections::HashMap::new();

    for token in tokens {
        let Some((key, value)) = token.split_once('=') else {
            return Err(Error::InvalidAssignment(token.clone()));
        };
        if !key_regex().is_match(key) {
            return Err(Error::InvalidAssignment(token.clone()));
        }
        if !values.contains_key(key) {
            order.push(key.to_string());
        }
        values.insert(key.to_string(), value.to_string());
    }

    Ok(order
        .into_iter()
        .map(|key| {
            let value = &values[&key];
            format!("{key}={value}")
        })
        .collect())
}

fn env_exec(service: String, host: &str, args: Vec<String>, stdin: StdinSource) -> Result<()> {
    let cancel = CancelToken::new();
    cancel.arm_ctrlc()?;
    let client = command::connect(host)?;
    exec::run(
        client,
        ExecRequest {
            service,
            args,
            ..Default::default()
        },
        stdin,
        &cancel,
    )?;
    Ok(())
}

pub fn show(service: Option<&str>) -> Result<()> {
    let (target, _project) = command::resolve_target(service)?;
    env_exec(
        target.service,
        &target.host,
        vec!["env".to_string(), "show".to_string()],
        StdinSource::Empty,
    )
}

/// Upload a local env file, recording it in project state when an entry
/// for the service already exists.
pub fn copy(file: &str, service: Option<&str>) -> Result<()> {
    let (target, mut project) = command::resolve_target(service)?;

    let path = Path::new(file);
    let reader = File::open(path).map_err(|e| Error::EncodeFailed {
        path: file.to_string(),
        source: e,
    })?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.to_string());

    info!(service = %target.service, file, "uploading env file");
    env_exec(
        target.service.clone(),
        &target.host,
        vec!["env".to_string(), "copy".to_string()],
        StdinSource::Payload(Box::new(reader), name),
    )?;

    // Remember the env file for the hash short-circuit on later deploys.
    if let Some(entry) = project.get(&target.service, &target.host).cloned() {
        let mut entry = entry;
        entry.env_file = Some(project.relativize(path));
        project.set_entry(entry);
        project.save()?;
    }
    Ok(())
}

pub fn set(assignments: &[String]) -> Result<()> {
    let normalized = normalize_assignments(assignments)?;
    let (target, _project) = command::resolve_target(None)?;

    let mut args = vec!["env".to_string(), "set".to_string()];
    args.extend(normalized);
    env_exec(target.service, &target.host, args, StdinSource::Empty)
}

/// Fetch the current env file, open it in $EDITOR, and push it back if it
/// changed.
pub fn edit(service: Option<&str>) -> Result<()> {
    let (target, _project) = command::resolve_target(service)?;

    // Capture the current contents instead of streaming to the terminal.
    let cancel = CancelToken::new();
    cancel.arm_ctrlc()?;
    let client = command::connect(&target.host)?;
    let mut current = Vec::new();
    let code = client.exec(
        &ExecRequest {
            service: target.service.clone(),
            args: vec!["env".to_string(), "show".to_string()],
            ..Default::default()
        },
        Box::new(std::io::empty()),
        &mut current,
        std::sync::mpsc::channel::<(u16, u16)>().1,
        &cancel,
    )?;
    if code != 0 {
        return Err(Error::RemoteExit { code, prefix: "" }.into());
    }

    let current = String::from_utf8_lossy(&current).into_owned();
    let edited = edit::edit(&current)?;
    if edited == current {
        println!("No changes");
        return Ok(());
    }

    env_exec(
        target.service.clone(),
        &target.host,
        vec!["env".to_string(), "copy".to_string()],
        StdinSource::Payload(Box::new(std::io::Cursor::new(edited.into_bytes())), ".env".to_string()),
    )?;
    println!("Environment updated for {}", target.service);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn duplicate_keys_keep_last_value() {
        let out =
            normalize_assignments(&strings(&["FOO=bar", "FOO=baz", "PORT=8080"])).unwrap();
        assert_eq!(out, vec!["FOO=baz", "PORT=8080"]);
    }

    #[test]
    fn keys_must_match_the_identifier_grammar() {
        assert!(normalize_assignments(&strings(&["_OK=1"])).is_ok());
        assert!(normalize_assignments(&strings(&["A9=1"])).is_ok());

        for bad in ["1BAD=x", "BAD-KEY=x", "=x", "NOEQUALS", "SP ACE=x"] {
            let err = normalize_assignments(&strings(&[bad])).unwrap_err();
            assert!(
                matches!(err, Error::InvalidAssignment(_)),
                "{bad} should be invalid"
            );
        }
    }

    #[test]
    fn values_may_contain_equals_and_be_empty() {
        let out = normalize_assignments(&strings(&["URL=http://x?a=b", "EMPTY="])).unwrap();
        assert_eq!(out, vec!["URL=http://x?a=b", "EMPTY="]);
    }

    #[test]
    fn order_is_first_occurrence() {
        let out =
            normalize_assignments(&strings(&["B=1", "A=2", "B=3"])).unwrap();
        assert_eq!(out, vec!["B=3", "A=2"]);
    }
}
