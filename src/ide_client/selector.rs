//! Session selection — pick one descriptor from a scan.
//!
//! One candidate is taken as-is. Several candidates are narrowed by a
//! workspace hint, or handed to a [`ChoicePrompt`] for a numbered pick.

use std::io::{BufRead, Write};

use super::errors::IdeError;
use super::types::SessionDescriptor;

// ─── ChoicePrompt ────────────────────────────────────────────────────────────

/// Supplies the user's answer when several sessions are running.
///
/// Implementations return the raw answer; the selector parses it as a
/// 1-based index.
pub trait ChoicePrompt: Send {
    fn choose(&mut self, candidates: &[SessionDescriptor]) -> Result<String, IdeError>;
}

/// Prompts on stdout and reads one line from stdin.
///
/// Blocks the calling thread while waiting for input. Under a current-thread
/// runtime, drive [`IdeClient::select_workspace`](crate::IdeClient::select_workspace)
/// from a dedicated thread if other tasks must keep running.
#[derive(Debug, Default)]
pub struct StdinPrompt;

impl ChoicePrompt for StdinPrompt {
    fn choose(&mut self, candidates: &[SessionDescriptor]) -> Result<String, IdeError> {
        let mut out = std::io::stdout().lock();
        let io_err = |e: std::io::Error| IdeError::TransportError {
            reason: format!("prompt I/O failed: {e}"),
        };

        writeln!(out, "Multiple IDE instances found:").map_err(io_err)?;
        for (i, d) in candidates.iter().enumerate() {
            writeln!(out, "  {}: {:?} (port: {})", i + 1, d.workspace_folders, d.port)
                .map_err(io_err)?;
        }
        write!(out, "Select instance (1-{}): ", candidates.len()).map_err(io_err)?;
        out.flush().map_err(io_err)?;

        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer).map_err(io_err)?;
        Ok(answer)
    }
}

// ─── Selection ───────────────────────────────────────────────────────────────

/// Pick a session.
///
/// - none → `NoSessionFound`
/// - exactly one → returned, hint ignored
/// - non-empty hint → first whose folders contain the hint, else `NoMatchingSession`
/// - otherwise → ask `prompt`; a non-numeric or out-of-range answer is `InvalidSelection`
pub fn select_session(
    mut descriptors: Vec<SessionDescriptor>,
    hint: Option<&str>,
    lock_dir_label: &str,
    prompt: &mut dyn ChoicePrompt,
) -> Result<SessionDescriptor, IdeError> {
    if descriptors.is_empty() {
        return Err(IdeError::NoSessionFound {
            dir: lock_dir_label.to_string(),
        });
    }

    if descriptors.len() == 1 {
        return Ok(descriptors.remove(0));
    }

    if let Some(hint) = hint.filter(|h| !h.is_empty()) {
        return match descriptors.iter().position(|d| d.matches_workspace(hint)) {
            Some(index) => Ok(descriptors.swap_remove(index)),
            None => Err(IdeError::NoMatchingSession {
                hint: hint.to_string(),
                candidates: descriptors
                    .into_iter()
                    .map(|d| d.workspace_folders)
                    .collect(),
            }),
        };
    }

    let answer = prompt.choose(&descriptors)?;
    let index = parse_choice(&answer, descriptors.len())?;
    Ok(descriptors.swap_remove(index))
}

/// Convert a 1-based answer into a 0-based index.
fn parse_choice(answer: &str, count: usize) -> Result<usize, IdeError> {
    let invalid = || IdeError::InvalidSelection {
        input: answer.trim().to_string(),
    };
    let choice: usize = answer.trim().parse().map_err(|_| invalid())?;
    if choice == 0 || choice > count {
        return Err(invalid());
    }
    Ok(choice - 1)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
