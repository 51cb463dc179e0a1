//! Upload a payload into the service's stage slot without activating it.

use std::path::Path;

use anyhow::Result;
use tracing::info;

use crate::cancel::CancelToken;
use crate::command;
use crate::exec::{self, StdinSource};
use crate::rpc::ExecRequest;
use crate::{classify, payload};

pub fn run(service: &str, file: &str) -> Result<()> {
    let (target, _project) = command::resolve_target(Some(service))?;

    let mut client = command::connect(&target.host)?;
    let host_info = client.info()?;
    let kind = classify::detect(Path::new(file), &host_info.os, &host_info.arch)?;
    let encoded = payload::open(Path::new(file), kind)?;
    let name = encoded.name().to_string();
    info!(service = %target.service, %kind, file, "staging payload");

    let cancel = CancelToken::new();
    cancel.arm_ctrlc()?;
    exec::run(
        client,
        ExecRequest {
            service: target.service.clone(),
            args: vec!["stage".to_string()],
            ..Default::default()
        },
        StdinSource::Payload(Box::new(encoded), name),
        &cancel,
    )?;
    println!("Staged {file} for {}", target.service);
    Ok(())
}
