//! Generate a Mermaid state diagram from the upgrade TRANSITIONS table.
//!
//! Usage:
//!   cargo run --bin statemachine_diagram                        # stdout
//!   cargo run --bin statemachine_diagram -- --out UPGRADE_STATES.md

use odoo_instance_operator::controller::state_machine::{TransitionAction, TRANSITIONS};
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let out: Option<PathBuf> = std::env::args()
        .skip_while(|a| a != "--out")
        .nth(1)
        .map(PathBuf::from);

    let md = generate();

    match out {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, &md) {
                eprintln!("failed to write {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
            eprintln!("wrote {}", path.display());
        }
        None => print!("{md}"),
    }
    ExitCode::SUCCESS
}

fn action_name(a: &TransitionAction) -> &'static str {
    match a {
        TransitionAction::TrackJob => "TrackJob",
        TransitionAction::RecordSuccess => "RecordSuccess",
        TransitionAction::RecordFailure => "RecordFailure",
        TransitionAction::ClearUpgradeRequest => "ClearUpgradeRequest",
        TransitionAction::NoteJobLost => "NoteJobLost",
    }
}

fn generate() -> String {
    let mut out = String::new();
    out.push_str("# Upgrade State Machine\n\n");
    out.push_str(
        "Auto-generated from the `TRANSITIONS` table in `controller/state_machine.rs`.\n\n",
    );
    out.push_str("```mermaid\nstateDiagram-v2\n");
    out.push_str("    [*] --> Idle\n\n");

    let mut current_from = String::new();
    for t in TRANSITIONS.iter() {
        let from = t.from.to_string();
        let to = t.to.to_string();

        if from != current_from {
            if !current_from.is_empty() {
                out.push('\n');
            }
            current_from = from.clone();
        }

        let guard_part = if t.guard_name.is_empty() {
            String::new()
        } else {
            format!("[{}]", t.guard_name)
        };

        let action_part = if t.actions.is_empty() {
            String::new()
        } else {
            let names: Vec<&str> = t.actions.iter().map(action_name).collect();
            format!("/ {}", names.join(", "))
        };

        let label = match (guard_part.is_empty(), action_part.is_empty()) {
            (true, true) => String::new(),
            (false, true) => format!(" : {guard_part}"),
            (true, false) => format!(" : {action_part}"),
            (false, false) => format!(" : {guard_part} {action_part}"),
        };

        out.push_str(&format!("    {from} --> {to}{label}\n"));
    }

    out.push_str("```\n");
    out
}
