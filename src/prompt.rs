/// Operator implementations for the command line

use colored::Colorize;
use std::io::{self, BufRead, Write};

use crate::core::archive::BackupArtifact;
use crate::core::catalog::has_sidecar;
use crate::core::confirm::Operator;
use crate::utils::{format_age, format_bytes};

/// Interactive operator reading answers from stdin
pub struct TerminalOperator<R: BufRead> {
    input: R,
}

impl TerminalOperator<io::BufReader<io::Stdin>> {
    pub fn stdin() -> Self {
        Self {
            input: io::BufReader::new(io::stdin()),
        }
    }
}

impl<R: BufRead> TerminalOperator<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }

    fn read_answer(&mut self, prompt: &str) -> String {
        print!("{}: ", prompt.bold());
        let _ = io::stdout().flush();

        let mut answer = String::new();
        // EOF or a read error counts as an empty answer, which every gate rejects
        if self.input.read_line(&mut answer).is_err() {
            return String::new();
        }
        answer.trim().to_string()
    }
}

/// One line per artifact, numbered from 1, as shown by `list` and the restore picker
pub fn artifact_line(index: usize, artifact: &BackupArtifact) -> String {
    let kind = artifact.kind.map(|k| k.as_str()).unwrap_or("legacy");
    let sidecar = if has_sidecar(&artifact.path) { "" } else { "  (no metadata)" };
    format!(
        "{:>3}. {:<50} {:<12} {:>10}  {}{}",
        index + 1,
        artifact.file_name(),
        kind,
        format_bytes(artifact.size_bytes),
        format_age(artifact.modified),
        sidecar
    )
}

impl<R: BufRead + Send> Operator for TerminalOperator<R> {
    fn select_artifact(&mut self, artifacts: &[BackupArtifact]) -> Option<usize> {
        println!("Available backups (newest first):\n");
        for (index, artifact) in artifacts.iter().enumerate() {
            println!("{}", artifact_line(index, artifact));
        }
        println!();

        let answer = self.read_answer(&format!("Select backup [1-{}] (empty to cancel)", artifacts.len()));
        match answer.parse::<usize>() {
            Ok(n) if n >= 1 && n <= artifacts.len() => Some(n - 1),
            _ => None,
        }
    }

    fn prompt_text(&mut self, prompt: &str, _expected: &str) -> String {
        self.read_answer(prompt)
    }

    fn affirm(&mut self, question: &str) -> bool {
        let answer = self.read_answer(&format!("{} [y/N]", question));
        matches!(answer.to_lowercase().as_str(), "y" | "yes")
    }

    fn warn(&mut self, message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message.yellow());
    }
}

/// Non-interactive operator behind `--yes`: every gate is passed and warnings go to stderr
#[derive(Debug, Default)]
pub struct AssumeYes;

impl Operator for AssumeYes {
    fn select_artifact(&mut self, artifacts: &[BackupArtifact]) -> Option<usize> {
        (!artifacts.is_empty()).then_some(0)
    }

    fn prompt_text(&mut self, prompt: &str, expected: &str) -> String {
        tracing::info!(prompt, answer = expected, "answered automatically");
        expected.to_string()
    }

    fn affirm(&mut self, question: &str) -> bool {
        tracing::info!(question, "affirmed automatically");
        true
    }

    fn warn(&mut self, message: &str) {
        eprintln!("{} {}", "⚠".yellow().bold(), message.yellow());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::confirm::run_gate;
    use std::io::Cursor;

    #[test]
    fn test_terminal_gate_from_input() {
        let mut operator = TerminalOperator::new(Cursor::new("shipping\nRESTORE\ny\n"));
        let confirmed = run_gate(&mut operator, "shipping", "RESTORE").unwrap();
        assert_eq!(confirmed.target(), "shipping");
    }

    #[test]
    fn test_terminal_eof_declines() {
        let mut operator = TerminalOperator::new(Cursor::new("shipping\n"));
        assert!(run_gate(&mut operator, "shipping", "RESTORE").unwrap_err().is_declined());
    }

    #[test]
    fn test_terminal_default_is_no() {
        let mut operator = TerminalOperator::new(Cursor::new("\n"));
        assert!(!operator.affirm("Continue?"));
    }

    #[test]
    fn test_assume_yes_passes_gate() {
        let confirmed = run_gate(&mut AssumeYes, "shipping", "RESET").unwrap();
        assert_eq!(confirmed.target(), "shipping");
    }
}
