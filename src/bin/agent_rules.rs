//! Render the node agent rule table and the status precedence table.
//!
//! Usage:
//!   cargo run --bin agent_rules                        # stdout
//!   cargo run --bin agent_rules -- --out AGENT_RULES.md

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;

use datadog_operator::controller::agent::AGENT_RULES;
use datadog_operator::controller::status::{DEFAULT_STATE, STATE_PRECEDENCE};

#[derive(Parser, Debug)]
#[command(name = "agent_rules", about = "Render the node agent rules as Markdown")]
struct Args {
    /// Write the Markdown to this file instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let md = generate();

    match args.out {
        Some(path) => {
            std::fs::write(&path, &md).with_context(|| format!("writing {}", path.display()))?;
            eprintln!("wrote {}", path.display());
        }
        None => print!("{md}"),
    }
    Ok(())
}

fn generate() -> String {
    let mut out = String::new();
    out.push_str("# Node Agent Rules\n\n");
    out.push_str("Auto-generated from `AGENT_RULES` in `controller/agent.rs` and ");
    out.push_str("`STATE_PRECEDENCE` in `controller/status.rs`.\n\n");

    // First matching guard wins, so the chart is a chain of decisions.
    out.push_str("```mermaid\nflowchart TD\n");
    out.push_str("    start([pass]) --> r0\n");
    for (i, rule) in AGENT_RULES.iter().enumerate() {
        out.push_str(&format!("    r{i}{{\"{}\"}}\n", rule.guard_name));
        out.push_str(&format!("    r{i} -- yes --> a{i}[{}]\n", rule.action));
        if i + 1 < AGENT_RULES.len() {
            out.push_str(&format!("    r{i} -- no --> r{}\n", i + 1));
        }
    }
    out.push_str("```\n\n");

    out.push_str("## Status precedence\n\n");
    out.push_str("| Order | Condition | State |\n|---|---|---|\n");
    for (i, rule) in STATE_PRECEDENCE.iter().enumerate() {
        out.push_str(&format!("| {} | {} | {} |\n", i + 1, rule.description, rule.state));
    }
    out.push_str(&format!(
        "| {} | otherwise | {} |\n",
        STATE_PRECEDENCE.len() + 1,
        DEFAULT_STATE
    ));
    out
}
