// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use parley_core::{Event, Message, Orchestrator, StartOverrides};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Arc::new(parley_config::load(cli.config.as_deref())?);

    match cli.command {
        Commands::Run {
            scenario,
            max_cycles,
            starting_agent,
            cycles,
            export,
            show_thoughts,
        } => {
            run_conversation(
                config,
                scenario.as_deref(),
                StartOverrides {
                    max_cycles,
                    starting_agent,
                },
                cycles,
                export.as_deref(),
                show_thoughts,
            )
            .await
        }
        Commands::Scenarios => list_scenarios(config),
        Commands::CheckEndpoint { agent } => check_endpoints(config, agent.as_deref()).await,
        Commands::Tools => tool_status(config).await,
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "parley=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_conversation(
    config: Arc<parley_config::Config>,
    scenario: Option<&str>,
    overrides: StartOverrides,
    cycles: Option<u32>,
    export: Option<&Path>,
    show_thoughts: bool,
) -> anyhow::Result<()> {
    config.validate()?;

    let mut orch = Orchestrator::new(config);
    orch.start_global_servers().await;

    let sub = orch.sink().subscribe("cli");
    let printer = tokio::spawn(print_events(sub, show_thoughts));

    let info = orch.start(scenario, overrides).await?;
    eprintln!(
        "[parley] conversation {} started with {} (max {} cycles)",
        info.conversation_id,
        info.participating_agents.join(", "),
        info.max_cycles
    );

    // Ctrl-C requests a graceful stop; the run loop unwinds at the next
    // await point and publishes the ended lifecycle.
    let handle = orch.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.stop();
        }
    });

    let outcome = orch.run(cycles).await?;
    if let Some(reason) = &outcome.termination_reason {
        eprintln!(
            "[parley] ended after cycle {} ({reason})",
            outcome.current_cycle
        );
    } else {
        eprintln!(
            "[parley] paused after cycle {} (not terminated)",
            outcome.current_cycle
        );
    }

    if let Some(path) = export {
        let transcript = render_transcript(&orch.transcript());
        std::fs::write(path, transcript)
            .with_context(|| format!("writing transcript to {}", path.display()))?;
        eprintln!("[parley] transcript written to {}", path.display());
    }

    orch.tools().stop_all().await;
    orch.sink().unsubscribe("cli");
    let _ = printer.await;
    Ok(())
}

/// Translate observer events to the terminal: utterances on stdout,
/// everything else as tagged stderr lines.
async fn print_events(mut sub: parley_core::Subscription, show_thoughts: bool) {
    while let Some(event) = sub.recv().await {
        match event {
            Event::AgentMessage {
                display_name,
                content,
                cycle,
                ..
            } => {
                println!("\n[{display_name} · cycle {cycle}]\n{content}");
                let _ = std::io::stdout().flush();
            }
            Event::Thought { agent_id, chunk, .. } if show_thoughts => {
                eprint!("[parley:thought:{agent_id}] {chunk}");
            }
            Event::Thought { .. } => {}
            Event::TurnIndicator { agent_id } => {
                eprintln!("[parley:turn] {agent_id}");
            }
            Event::ToolCall {
                agent_id,
                tool_name,
                args,
            } => {
                eprintln!("[parley:tool:call] agent={agent_id} name={tool_name} args={args}");
            }
            Event::ToolResult {
                tool_name,
                result_preview,
                duration_ms,
            } => {
                eprintln!(
                    "[parley:tool:result] name={tool_name} duration_ms={duration_ms} preview={result_preview:?}"
                );
            }
            Event::CycleUpdate { cycle, .. } => {
                eprintln!("[parley:cycle] {cycle} complete");
            }
            Event::Lifecycle { kind, detail } => {
                eprintln!("[parley:lifecycle] {kind:?} {detail}");
            }
            Event::Error {
                kind,
                agent_id,
                message,
            } => {
                let agent = agent_id.unwrap_or_default();
                eprintln!("[parley:error] kind={kind} agent={agent} {message}");
            }
        }
    }
}

fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::from("# Conversation transcript\n");
    for msg in messages {
        let heading = match msg.cycle_index {
            Some(cycle) => format!("\n## {} (cycle {})\n\n", msg.author, cycle),
            None => format!("\n## {}\n\n", msg.author),
        };
        out.push_str(&heading);
        if !msg.tool_calls.is_empty() {
            for call in &msg.tool_calls {
                out.push_str(&format!(
                    "*tool call `{}` → {}*\n\n",
                    call.tool_name, call.arguments
                ));
            }
        }
        if !msg.content.is_empty() {
            out.push_str(msg.content.trim_end());
            out.push('\n');
        }
    }
    out
}

fn list_scenarios(config: Arc<parley_config::Config>) -> anyhow::Result<()> {
    config.validate()?;
    let orch = Orchestrator::new(config);
    for sc in orch.list_scenarios() {
        let marker = if sc.is_default { " (default)" } else { "" };
        println!(
            "{}{marker}: {} cycles, agents: {}",
            sc.name,
            sc.max_cycles,
            sc.participating_agents.join(", ")
        );
    }
    Ok(())
}

async fn check_endpoints(
    config: Arc<parley_config::Config>,
    only_agent: Option<&str>,
) -> anyhow::Result<()> {
    let mut failed = false;
    for agent in &config.agents {
        if let Some(wanted) = only_agent {
            if agent.id != wanted {
                continue;
            }
        }
        let check = parley_core::test_model_endpoint(&agent.model).await;
        let status = if check.ok { "ok" } else { "FAILED" };
        println!(
            "{}: {} {} — {}",
            agent.id, agent.model.provider, status, check.detail
        );
        failed |= !check.ok;
    }
    if failed {
        anyhow::bail!("one or more endpoints failed the probe");
    }
    Ok(())
}

async fn tool_status(config: Arc<parley_config::Config>) -> anyhow::Result<()> {
    let mut orch = Orchestrator::new(config);
    orch.start_global_servers().await;
    let statuses = orch.tools().statuses().await;
    if statuses.is_empty() {
        println!("no tool servers configured");
    }
    for server in statuses {
        println!(
            "{}: {:?} — tools: {}",
            server.name,
            server.status,
            if server.tool_names.is_empty() {
                "none".to_string()
            } else {
                server.tool_names.join(", ")
            }
        );
    }
    orch.tools().stop_all().await;
    Ok(())
}
