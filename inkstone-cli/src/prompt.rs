//! Interactive conflict prompt on the terminal

use async_trait::async_trait;
use inkstone_core::{Conflict, ConflictKind, ConflictResolver, Resolution, Result, SyncError};
use std::io::{self, BufRead, Write};

/// Maximum unrecognised answers before the prompt gives up.
const MAX_ATTEMPTS: usize = 3;

/// Asks on stderr/stdin how each conflict should be settled.
pub struct PromptResolver;

#[async_trait]
impl ConflictResolver for PromptResolver {
    async fn resolve(&self, conflict: &Conflict) -> Result<Resolution> {
        let conflict = conflict.clone();
        tokio::task::spawn_blocking(move || {
            let stdin = io::stdin();
            let mut input = stdin.lock();
            ask(&conflict, &mut input, &mut io::stderr())
        })
        .await
        .map_err(|e| SyncError::Resolver(format!("prompt task failed: {}", e)))?
    }
}

fn question(conflict: &Conflict) -> String {
    match conflict.kind {
        ConflictKind::RemoteDelete => format!(
            "{} was deleted remotely but has local content ({}).\nKeep the local copy? [k]eep / [d]iscard: ",
            conflict.path,
            conflict.local_state.as_str()
        ),
        ConflictKind::RemoteUpdate => format!(
            "{} changed remotely ({}) and locally ({}).\nKeep the local version? [k]eep / [d]iscard: ",
            conflict.path,
            conflict.remote_sha.as_deref().map(short_sha).unwrap_or("?"),
            conflict.local_state.as_str()
        ),
    }
}

pub fn parse_answer(line: &str) -> Option<Resolution> {
    match line.trim().to_ascii_lowercase().as_str() {
        "k" | "keep" | "l" | "local" => Some(Resolution::KeepLocal),
        "d" | "discard" | "r" | "remote" => Some(Resolution::DiscardLocal),
        _ => None,
    }
}

/// Read answers from `input` until one parses. End of input cancels.
fn ask(conflict: &Conflict, input: &mut impl BufRead, out: &mut impl Write) -> Result<Resolution> {
    for _ in 0..MAX_ATTEMPTS {
        write!(out, "{}", question(conflict))?;
        out.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Err(SyncError::Resolver(format!(
                "no answer for {}",
                conflict.path
            )));
        }
        if let Some(resolution) = parse_answer(&line) {
            return Ok(resolution);
        }
        writeln!(out, "Please answer 'keep' or 'discard'.")?;
    }
    Err(SyncError::Resolver(format!(
        "no valid answer for {}",
        conflict.path
    )))
}

pub fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}
