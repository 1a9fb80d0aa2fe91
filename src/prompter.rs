//! The prompter port
//!
//! During a run the worker occasionally needs an answer from the
//! operator (retry the ROM handshake, resolve a filesystem merge
//! failure). The worker only sees this trait; interactive frontends block
//! on the UI, headless ones answer immediately.

use log::info;

/// Ask the operator to pick one of `choices`. Returns the chosen index.
pub trait Prompter: Send + Sync {
    fn prompt(&self, text: &str, choices: &[&str]) -> usize;
}

/// Prompter for non-interactive use: logs the question and picks the
/// first choice.
#[derive(Debug, Default)]
pub struct HeadlessPrompter;

impl Prompter for HeadlessPrompter {
    fn prompt(&self, text: &str, choices: &[&str]) -> usize {
        info!("Prompt: {}", text);
        info!("Not interactive, answering: {}", choices[0]);
        0
    }
}
