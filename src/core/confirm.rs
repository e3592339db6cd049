/// Typed confirmation gate for destructive operations
///
/// A `FinalConfirmed` token can only be obtained by consuming a
/// `KeywordConfirmed`, which in turn needs a `NameConfirmed`. Functions that
/// drop or overwrite a database take a `&FinalConfirmed`, so skipping a stage
/// does not compile.

use serde::Serialize;

use crate::core::archive::BackupArtifact;
use crate::core::error::{BackupError, BackupResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ConfirmationLevel {
    Unconfirmed,
    NameConfirmed,
    KeywordConfirmed,
    FinalConfirmed,
}

/// Operator interaction used by the orchestrators
#[cfg_attr(test, mockall::automock)]
pub trait Operator: Send {
    /// Pick one of `artifacts` (newest first); `None` cancels
    fn select_artifact(&mut self, artifacts: &[BackupArtifact]) -> Option<usize>;

    /// Ask for free text. `expected` is the answer that lets the operation
    /// proceed; non-interactive operators echo it back.
    fn prompt_text(&mut self, prompt: &str, expected: &str) -> String;

    /// Yes/no question
    fn affirm(&mut self, question: &str) -> bool;

    fn warn(&mut self, message: &str);
}

fn declined(stage: &str) -> BackupError {
    tracing::info!(stage, "confirmation declined");
    BackupError::ConfirmationDeclined {
        stage: stage.to_string(),
    }
}

/// Start of the sequence for one target and operation keyword
#[derive(Debug)]
pub struct ConfirmationGate {
    target: String,
    keyword: String,
}

#[derive(Debug)]
pub struct NameConfirmed {
    target: String,
    keyword: String,
}

#[derive(Debug)]
pub struct KeywordConfirmed {
    target: String,
}

#[derive(Debug)]
pub struct FinalConfirmed {
    target: String,
}

impl ConfirmationGate {
    pub fn new(target: impl Into<String>, keyword: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            keyword: keyword.into(),
        }
    }

    pub fn level(&self) -> ConfirmationLevel {
        ConfirmationLevel::Unconfirmed
    }

    /// The operator must type the exact target database name
    pub fn confirm_name(self, typed: &str) -> BackupResult<NameConfirmed> {
        if typed.trim() != self.target {
            return Err(declined("database name"));
        }
        Ok(NameConfirmed {
            target: self.target,
            keyword: self.keyword,
        })
    }
}

impl NameConfirmed {
    pub fn level(&self) -> ConfirmationLevel {
        ConfirmationLevel::NameConfirmed
    }

    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    /// The operator must type the operation keyword, e.g. `RESTORE`
    pub fn confirm_keyword(self, typed: &str) -> BackupResult<KeywordConfirmed> {
        if typed.trim() != self.keyword {
            return Err(declined("keyword"));
        }
        Ok(KeywordConfirmed { target: self.target })
    }
}

impl KeywordConfirmed {
    pub fn level(&self) -> ConfirmationLevel {
        ConfirmationLevel::KeywordConfirmed
    }

    pub fn confirm_final(self, affirmed: bool) -> BackupResult<FinalConfirmed> {
        if !affirmed {
            return Err(declined("final confirmation"));
        }
        Ok(FinalConfirmed { target: self.target })
    }
}

impl FinalConfirmed {
    pub fn level(&self) -> ConfirmationLevel {
        ConfirmationLevel::FinalConfirmed
    }

    /// Database this confirmation authorises changes to
    pub fn target(&self) -> &str {
        &self.target
    }
}

/// Walk an operator through all three stages for `target`
pub fn run_gate(operator: &mut dyn Operator, target: &str, keyword: &str) -> BackupResult<FinalConfirmed> {
    operator.warn(&format!(
        "This will DROP database '{}' and replace its contents.",
        target
    ));

    let gate = ConfirmationGate::new(target, keyword);
    let typed = operator.prompt_text(&format!("Type the database name '{}' to continue", target), target);
    let named = gate.confirm_name(&typed)?;

    let typed = operator.prompt_text(&format!("Type {} to confirm", named.keyword()), named.keyword());
    let keyed = named.confirm_keyword(&typed)?;

    let affirmed = operator.affirm(&format!("Last chance: {} '{}' now?", keyword.to_lowercase(), target));
    let confirmed = keyed.confirm_final(affirmed)?;

    tracing::info!(target_db = target, "all confirmations received");
    Ok(confirmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::*;

    #[test]
    fn test_tokens_advance_in_order() {
        let named = ConfirmationGate::new("shipping", "RESTORE").confirm_name("shipping").unwrap();
        assert_eq!(named.level(), ConfirmationLevel::NameConfirmed);
        let keyed = named.confirm_keyword(" RESTORE ").unwrap();
        assert_eq!(keyed.level(), ConfirmationLevel::KeywordConfirmed);
        let done = keyed.confirm_final(true).unwrap();
        assert_eq!(done.level(), ConfirmationLevel::FinalConfirmed);
        assert_eq!(done.target(), "shipping");
    }

    #[test]
    fn test_wrong_name_declines() {
        let err = ConfirmationGate::new("shipping", "RESTORE").confirm_name("shiping").unwrap_err();
        assert!(err.is_declined());
    }

    #[test]
    fn test_keyword_is_case_sensitive() {
        let named = ConfirmationGate::new("shipping", "RESTORE").confirm_name("shipping").unwrap();
        assert!(named.confirm_keyword("restore").unwrap_err().is_declined());
    }

    #[test]
    fn test_run_gate_all_affirmative() {
        let mut operator = MockOperator::new();
        operator.expect_warn().times(1).return_const(());
        operator
            .expect_prompt_text()
            .with(function(|p: &str| p.contains("database name")), always())
            .times(1)
            .return_const("shipping".to_string());
        operator
            .expect_prompt_text()
            .with(function(|p: &str| p.contains("RESTORE")), always())
            .times(1)
            .return_const("RESTORE".to_string());
        operator.expect_affirm().times(1).return_const(true);

        let confirmed = run_gate(&mut operator, "shipping", "RESTORE").unwrap();
        assert_eq!(confirmed.target(), "shipping");
    }

    #[test]
    fn test_run_gate_stops_at_first_refusal() {
        let mut operator = MockOperator::new();
        operator.expect_warn().return_const(());
        operator.expect_prompt_text().times(1).return_const("nope".to_string());
        operator.expect_affirm().never();

        match run_gate(&mut operator, "shipping", "RESTORE") {
            Err(BackupError::ConfirmationDeclined { stage }) => assert_eq!(stage, "database name"),
            other => panic!("expected decline, got {:?}", other),
        }
    }

    #[test]
    fn test_run_gate_final_no() {
        let mut operator = MockOperator::new();
        operator.expect_warn().return_const(());
        operator
            .expect_prompt_text()
            .with(function(|p: &str| p.contains("database name")), always())
            .return_const("shipping".to_string());
        operator
            .expect_prompt_text()
            .with(function(|p: &str| p.starts_with("Type RESTORE")), eq("RESTORE"))
            .return_const("RESTORE".to_string());
        operator.expect_affirm().times(1).return_const(false);

        let err = run_gate(&mut operator, "shipping", "RESTORE").unwrap_err();
        assert!(matches!(err, BackupError::ConfirmationDeclined { ref stage } if stage == "final confirmation"));
    }
}
