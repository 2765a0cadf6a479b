//! Command implementations: verb → request mapping, human-readable status
//! rendering, and the two interactive sessions (penance submission and
//! writing-lines).

use std::io::BufRead;

use anyhow::{bail, Context, Result};
use vex_core::compliance::ComplianceStore;
use vex_core::manifest::{self, Manifest};
use vex_core::paths::OPERATOR_GROUP;
use vex_core::protocol::{commands as cmd, Request, Response};
use vex_core::state::SystemState;
use vex_core::Paths;
use vexd::input::InputMonitor;

use crate::client::Client;

/// Root, or membership in the operator group, is required to drive the
/// daemon.
#[must_use]
pub fn operator_access() -> bool {
    if nix::unistd::Uid::effective().is_root() {
        return true;
    }
    let Ok(Some(group)) = nix::unistd::Group::from_name(OPERATOR_GROUP) else {
        return false;
    };
    nix::unistd::getgroups()
        .map(|groups| groups.contains(&group.gid))
        .unwrap_or(false)
}

fn send(client: &Client, request: &Request) -> Result<Response> {
    let response = client.send(request)?;
    if !response.ok {
        bail!(
            "command failed: {}",
            response.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(response)
}

fn response_state(response: &Response) -> Result<&SystemState> {
    response
        .state
        .as_ref()
        .context("daemon response carried no state")
}

/// `status`: human-readable report.
pub fn status(client: &Client) -> Result<()> {
    let response = send(client, &Request::bare(cmd::STATUS))?;
    let s = response_state(&response)?;

    println!("========================================");
    println!("VEX STATUS REPORT");
    println!("========================================");
    println!();
    println!("[COMPLIANCE]");
    println!("  System Locked:  {}", s.compliance.locked);
    println!("  Failure Score:  {}", s.compliance.failure_score);
    println!("  Task Status:    {}", s.compliance.task_status);
    println!();
    println!("[NETWORK]");
    println!("  Profile:      {}", s.network.profile);
    println!("  Packet Loss:  {:.2}%", s.network.packet_loss_pct);
    println!();
    println!("[COMPUTE]");
    println!("  CPU Limit:      {}%", s.compute.cpu_limit_pct);
    println!("  OOM Score Adj:  {}", s.compute.oom_score_adj);
    println!("  Input Latency:  {}ms", s.compute.input_latency_ms);
    println!();
    println!("[GUARDIAN]");
    println!("  Firewall: {}", s.guardian.firewall_enabled);
    println!("  Reaper:   {}", s.guardian.reaper_enabled);
    if !s.guardian.blocked_domains.is_empty() {
        println!("  Blocked:  {} domains", s.guardian.blocked_domains.len());
        for domain in &s.guardian.blocked_domains {
            println!("            - {domain}");
        }
    }
    if s.writing.active {
        println!();
        println!("[WRITING TASK]");
        println!("  Phrase:    {:?}", s.writing.phrase);
        println!("  Progress:  {} / {}", s.writing.completed, s.writing.required);
        println!("  Remaining: {}", s.writing.required - s.writing.completed);
    }
    println!();
    println!(
        "State last updated: {} (by: {})",
        s.last_updated.to_rfc3339(),
        s.changed_by
    );
    println!("========================================");
    Ok(())
}

/// `state`: machine-readable JSON dump.
pub fn state_dump(client: &Client) -> Result<()> {
    let response = send(client, &Request::bare(cmd::STATE))?;
    let state = response_state(&response)?;
    println!("{}", serde_json::to_string_pretty(state)?);
    Ok(())
}

fn print_message(response: &Response) {
    if let Some(message) = &response.message {
        println!("{message}");
    }
}

/// `throttle <profile>`.
pub fn throttle(client: &Client, profile: &str) -> Result<()> {
    let response = send(client, &Request::with_arg(cmd::THROTTLE, "profile", profile))?;
    print_message(&response);
    Ok(())
}

/// `cpu <percent>`.
pub fn cpu(client: &Client, percent: &str) -> Result<()> {
    let response = send(client, &Request::with_arg(cmd::CPU, "percent", percent))?;
    print_message(&response);
    Ok(())
}

/// `latency <ms>`.
pub fn latency(client: &Client, ms: &str) -> Result<()> {
    let response = send(client, &Request::with_arg(cmd::LATENCY, "ms", ms))?;
    print_message(&response);
    Ok(())
}

/// `oom <score>`.
pub fn oom(client: &Client, score: &str) -> Result<()> {
    let response = send(client, &Request::with_arg(cmd::OOM, "score", score))?;
    print_message(&response);
    Ok(())
}

/// `unlock` (payload already verified by the caller).
pub fn unlock(client: &Client) -> Result<()> {
    println!("Lifting restrictions (authorized)…");
    let response = send(client, &Request::bare(cmd::UNLOCK))?;
    print_message(&response);
    Ok(())
}

/// `reset-score` (payload already verified by the caller).
pub fn reset_score(client: &Client) -> Result<()> {
    println!("Resetting failure score (authorized)…");
    let response = send(client, &Request::bare(cmd::RESET_SCORE))?;
    print_message(&response);
    Ok(())
}

/// `check`.
pub fn check(client: &Client) -> Result<()> {
    let response = send(client, &Request::bare(cmd::CHECK))?;
    print_message(&response);
    Ok(())
}

/// `block ...` subcommands with the bare-domain shorthand.
pub fn block(client: &Client, args: &[String]) -> Result<()> {
    match args {
        [] => block_list(client),
        [sub, domain] if sub == "add" => block_add(client, domain),
        [sub, domain] if sub == "rm" || sub == "remove" || sub == "del" => {
            block_remove(client, domain)
        }
        [sub] if sub == "list" || sub == "ls" => block_list(client),
        [domain] => block_add(client, domain),
        _ => bail!("usage: vex-cli block [add <domain> | rm <domain> | list | <domain>]"),
    }
}

fn block_add(client: &Client, domain: &str) -> Result<()> {
    let response = send(client, &Request::with_arg(cmd::BLOCK_ADD, "domain", domain))?;
    print_message(&response);
    Ok(())
}

fn block_remove(client: &Client, domain: &str) -> Result<()> {
    let response = send(client, &Request::with_arg(cmd::BLOCK_REMOVE, "domain", domain))?;
    print_message(&response);
    Ok(())
}

fn block_list(client: &Client) -> Result<()> {
    let response = send(client, &Request::bare(cmd::BLOCK_LIST))?;
    let s = response_state(&response)?;

    println!("[GUARDIAN - BLOCKED DOMAINS]");
    println!("  Firewall Enabled: {}", s.guardian.firewall_enabled);
    println!("  Process Reaper:   {}", s.guardian.reaper_enabled);
    println!();
    if s.guardian.blocked_domains.is_empty() {
        println!("  (no domains blocked)");
    } else {
        for (i, domain) in s.guardian.blocked_domains.iter().enumerate() {
            println!("  {}. {domain}", i + 1);
        }
        println!();
        println!("  Total: {} domains", s.guardian.blocked_domains.len());
    }
    Ok(())
}

/// `app ...` subcommands.
pub fn app(client: &Client, args: &[String]) -> Result<()> {
    match args {
        [] => app_list(client),
        [sub, name] if sub == "add" => {
            let response = send(client, &Request::with_arg(cmd::APP_ADD, "app", name))?;
            print_message(&response);
            Ok(())
        }
        [sub, name] if sub == "rm" || sub == "remove" || sub == "del" => {
            let response = send(client, &Request::with_arg(cmd::APP_REMOVE, "app", name))?;
            print_message(&response);
            Ok(())
        }
        [sub] if sub == "list" || sub == "ls" => app_list(client),
        _ => bail!("usage: vex-cli app [add <name> | rm <name> | list]"),
    }
}

fn app_list(client: &Client) -> Result<()> {
    let response = send(client, &Request::bare(cmd::APP_LIST))?;
    println!("[GUARDIAN - FORBIDDEN APPS]");
    let listing = response.message.unwrap_or_default();
    if listing.is_empty() {
        println!("  (no forbidden apps)");
    } else {
        let apps: Vec<&str> = listing.split(',').collect();
        for (i, app) in apps.iter().enumerate() {
            println!("  {}. {app}", i + 1);
        }
        println!();
        println!("  Total: {} apps", apps.len());
    }
    Ok(())
}

/// `lines ...` subcommands; bare `lines` shows status.
pub fn lines(client: &Client, args: &[String]) -> Result<()> {
    match args.split_first() {
        None => lines_status(client),
        Some((sub, rest)) if sub == "set" => {
            let [count, phrase @ ..] = rest else {
                bail!("usage: vex-cli lines set <count> <phrase>");
            };
            if phrase.is_empty() {
                bail!("usage: vex-cli lines set <count> <phrase>");
            }
            let phrase = phrase.join(" ");
            let response = send(
                client,
                &Request::with_arg(cmd::LINES_SET, "count", count).arg("phrase", &phrase),
            )?;
            print_message(&response);
            Ok(())
        }
        Some((sub, _)) if sub == "clear" || sub == "cancel" => {
            let response = send(client, &Request::bare(cmd::LINES_CLEAR))?;
            print_message(&response);
            Ok(())
        }
        Some((sub, _)) if sub == "status" => lines_status(client),
        Some((sub, _)) if sub == "submit" => lines_submit_interactive(client),
        Some((sub, _)) => bail!("unknown lines subcommand: {sub}"),
    }
}

fn lines_status(client: &Client) -> Result<()> {
    let response = send(client, &Request::bare(cmd::LINES_STATUS))?;
    let s = response_state(&response)?;
    if !s.writing.active {
        println!("No active writing task.");
        return Ok(());
    }
    println!("[WRITING TASK]");
    println!("  Phrase:    {:?}", s.writing.phrase);
    println!("  Progress:  {} / {}", s.writing.completed, s.writing.required);
    println!("  Remaining: {}", s.writing.required - s.writing.completed);
    Ok(())
}

fn lines_submit_interactive(client: &Client) -> Result<()> {
    let response = send(client, &Request::bare(cmd::LINES_STATUS))?;
    let s = response_state(&response)?;
    if !s.writing.active {
        println!("No active writing task.");
        return Ok(());
    }

    println!("========================================");
    println!("WRITING LINES - DISCIPLINARY PROTOCOL");
    println!("========================================");
    println!("Phrase:    {:?}", s.writing.phrase);
    println!("Remaining: {} lines", s.writing.required - s.writing.completed);
    println!("----------------------------------------");
    println!("Type the exact phrase on each line. Ctrl+D to stop.");
    println!("----------------------------------------");

    let stdin = std::io::stdin();
    let mut accepted = 0u32;
    let mut rejected = 0u32;
    for line in stdin.lock().lines() {
        let line = line?;
        let response = client.send(&Request::with_arg(cmd::LINES_SUBMIT, "line", &line))?;
        if response.ok {
            accepted += 1;
            if let Some(message) = &response.message {
                println!("  + {message}");
            }
            if response.state.as_ref().is_some_and(|s| !s.writing.active) {
                break;
            }
        } else {
            rejected += 1;
            println!(
                "  x REJECTED: {}",
                response.error.unwrap_or_else(|| "mismatch".to_string())
            );
        }
    }

    println!();
    println!("Session: {accepted} accepted, {rejected} rejected");
    Ok(())
}

/// `penance`: interactive typed submission validated against the
/// manifest, ending in an unlock on success.
pub fn penance(client: &Client, paths: &Paths) -> Result<()> {
    let manifest =
        Manifest::load(&paths.manifest_file()).context("failed to load penance manifest")?;
    let compliance = ComplianceStore::new(paths.compliance_file());

    // Keystroke metrics need device access; only attempt them as root so
    // group-member sessions aren't drowned in permission warnings.
    let surveillance = if nix::unistd::Uid::effective().is_root() {
        let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
        let monitor = {
            let _guard = runtime.enter();
            let monitor = InputMonitor::new();
            monitor.start();
            monitor
        };
        Some((runtime, monitor))
    } else {
        None
    };

    print_penance_banner(&manifest);

    let stdin = std::io::stdin();
    let mut submission = String::new();
    let mut line_num = 0u32;
    let mut total_words = 0usize;
    for line in stdin.lock().lines() {
        let line = line?;
        if !manifest::validate_line(&line, &manifest.active.constraints) {
            println!("[ERROR] Backspace detected! Line REJECTED. Retype the entire line.");
            let _ = compliance.record_failure("backspace_violation");
            continue;
        }
        line_num += 1;
        let words = line.split_whitespace().count();
        total_words += words;
        submission.push_str(&line);
        submission.push('\n');

        println!(
            "  [line {line_num}] {words} words (total: {total_words}/{})",
            manifest.active.required_content.min_word_count
        );

        // Register progress with the daemon; content stays local.
        let _ = client.send(
            &Request::with_arg(cmd::PENANCE_INPUT, "num", &line_num.to_string()),
        );
        let _ = compliance.mark_in_progress();
    }

    println!();
    println!("Verifying submission…");
    let kpm = surveillance
        .as_ref()
        .map(|(_, monitor)| monitor.current_kpm())
        .filter(|kpm| *kpm > 0.0);
    let result = manifest::validate_submission(&submission, &manifest, kpm);

    if !result.valid {
        for error in &result.errors {
            println!("[FAIL] {error}");
        }
        println!();
        println!("Submission REJECTED. Penance continues.");
        let _ = compliance.record_failure("submission_rejected");
        std::process::exit(1);
    }

    println!();
    println!("Submission ACCEPTED.");
    compliance
        .record_completion()
        .context("failed to record completion")?;

    send(client, &Request::bare(cmd::UNLOCK))?;
    println!("System state normalized. You may proceed.");
    Ok(())
}

fn print_penance_banner(manifest: &Manifest) {
    println!();
    println!("========================================");
    println!("VEXATION PROTOCOL ACTIVE");
    println!("Subject: {}", manifest.meta.target_id);
    println!("Violation Level: {}", manifest.active.task_type);
    println!("========================================");
    println!("INSTRUCTIONS:");
    println!("Topic: {}", manifest.active.required_content.topic);
    println!(
        "Minimum Word Count: {}",
        manifest.active.required_content.min_word_count
    );
    if !manifest.active.required_content.validation_strings.is_empty() {
        println!(
            "Must include phrases: {:?}",
            manifest.active.required_content.validation_strings
        );
    }
    if !manifest.active.constraints.allow_backspace {
        println!("WARNING: Backspace is DISABLED. Errors require full line reset.");
    }
    if manifest.active.constraints.enforce_rhythm {
        println!(
            "Typing speed: {}-{} KPM enforced",
            manifest.active.constraints.min_kpm, manifest.active.constraints.max_kpm
        );
    }
    println!("----------------------------------------");
    println!("Type your submission below. Press Ctrl+D (EOF) when finished.");
    println!("----------------------------------------");
}
