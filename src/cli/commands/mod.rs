//! CLI command handlers.

pub mod agent;
pub mod events;
pub mod hook;
pub mod master;
pub mod run;

use crate::protocol::{ClientResponse, ErrorKind};

use super::exit;

/// Map a remote error onto an exit code.
pub(crate) fn exit_code_for(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::AgentUnreachable | ErrorKind::AgentBusy => exit::AGENT_UNREACHABLE,
        _ => exit::FAILURE,
    }
}

/// Print the single final failure line: category and component, nothing
/// else. Full diagnostics go to the structured logs.
pub(crate) fn print_failure(component: &str, kind: ErrorKind, message: &str) {
    let category = match kind {
        ErrorKind::AgentUnknown => "agent_unknown",
        ErrorKind::AgentUnreachable => "agent_unreachable",
        ErrorKind::AgentBusy => "agent_busy",
        ErrorKind::NotFound => "not_found",
        ErrorKind::PolicyViolation => "policy_violation",
        ErrorKind::Internal => "internal",
    };
    eprintln!("error: {category} ({component}): {message}");
}

/// Handle an unexpected response shape from the master.
pub(crate) fn unexpected(component: &str, response: &ClientResponse) -> u8 {
    print_failure(component, ErrorKind::Internal, &format!("unexpected response: {response:?}"));
    exit::FAILURE
}

/// Re-exec the current binary detached from the terminal, minus the
/// `--daemon` flag, and report the child pid.
pub(crate) fn daemonize() -> anyhow::Result<u8> {
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    let exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args().skip(1).filter(|a| a != "--daemon").collect();
    let child = Command::new(exe)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()?;
    println!("started (pid {})", child.id());
    Ok(exit::OK)
}
