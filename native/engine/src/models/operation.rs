use std::fmt;

use serde::{Deserialize, Serialize};

use super::DataCategory;
use crate::shell::{EXIT_NOT_PRESENT, ShellResult};

/// Lifecycle of one operation record, ordered `Idle -> Processing -> {Done | Error | Skip}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    #[default]
    Idle,
    Processing,
    Done,
    Error,
    Skip,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Done | OperationState::Error | OperationState::Skip)
    }

    pub fn is_unfinished(&self) -> bool {
        !self.is_terminal()
    }

    /// Maps a command exit code onto a terminal state.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => OperationState::Done,
            EXIT_NOT_PRESENT => OperationState::Skip,
            _ => OperationState::Error,
        }
    }

    /// Whether `self -> next` is allowed within a single run.
    ///
    /// Terminal states never go back to `Idle`/`Processing`; the only terminal-to-terminal
    /// move is `Done -> Error`, used when a later step (upload) fails.
    pub fn can_transition_to(&self, next: OperationState) -> bool {
        match (self, next) {
            (current, next) if *current == next => true,
            (OperationState::Done, OperationState::Error) => true,
            (current, _) if current.is_terminal() => false,
            (OperationState::Processing, OperationState::Idle) => false,
            _ => true,
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationState::Idle => write!(f, "Idle"),
            OperationState::Processing => write!(f, "Processing"),
            OperationState::Done => write!(f, "Done"),
            OperationState::Error => write!(f, "Error"),
            OperationState::Skip => write!(f, "Skipped"),
        }
    }
}

/// Step a category was in when its state was last written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStage {
    #[default]
    Pending,
    /// Reading permissions and the device-scoped id for the package config.
    CapturingMetadata,
    Archive,
    Upload,
    Download,
    Extract,
    Install,
    Apply,
}

/// Status of one data category of one package within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryOperationRecord {
    pub category: DataCategory,
    pub state: OperationState,
    pub stage: OperationStage,
    pub byte_count: u64,
    pub log_text: String,
}

impl CategoryOperationRecord {
    pub fn new(category: DataCategory) -> Self {
        Self {
            category,
            state: OperationState::Idle,
            stage: OperationStage::Pending,
            byte_count: 0,
            log_text: String::new(),
        }
    }

    /// Moves to `state` if allowed, returning whether the state changed.
    pub fn transition(&mut self, state: OperationState) -> bool {
        if self.state == state || !self.state.can_transition_to(state) {
            return false;
        }
        self.state = state;
        true
    }

    pub fn append_log(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.log_text.is_empty() && !self.log_text.ends_with('\n') {
            self.log_text.push('\n');
        }
        self.log_text.push_str(text);
    }

    /// Appends the command line and its output.
    pub fn append_result(&mut self, result: &ShellResult) {
        if !result.input_tokens.is_empty() {
            self.append_log(&format!("$ {}", result.input_tokens.join(" ")));
        }
        self.append_log(&result.output());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Package,
    Media,
}

/// Status of one package (or media item) within one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageOperationRecord {
    pub kind: RecordKind,
    /// Package name, or the media item name.
    pub name: String,
    pub label: String,
    pub user_id: u32,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub overall_state: OperationState,
    pub sub_records: Vec<CategoryOperationRecord>,
}

impl PackageOperationRecord {
    pub fn new(
        kind: RecordKind,
        name: impl Into<String>,
        label: impl Into<String>,
        user_id: u32,
        categories: &[DataCategory],
        start_time: i64,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            label: label.into(),
            user_id,
            start_time,
            end_time: None,
            overall_state: OperationState::Processing,
            sub_records: categories.iter().copied().map(CategoryOperationRecord::new).collect(),
        }
    }

    pub fn sub_record(&self, category: DataCategory) -> Option<&CategoryOperationRecord> {
        self.sub_records.iter().find(|r| r.category == category)
    }

    pub fn sub_record_mut(&mut self, category: DataCategory) -> Option<&mut CategoryOperationRecord> {
        self.sub_records.iter_mut().find(|r| r.category == category)
    }

    /// `Done` unless any category ended in `Error`.
    pub fn compute_overall_state(&self) -> OperationState {
        if self.sub_records.iter().any(|r| r.state == OperationState::Error) {
            OperationState::Error
        } else {
            OperationState::Done
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Backup,
    Restore,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Backup => write!(f, "Backup"),
            RunKind::Restore => write!(f, "Restore"),
        }
    }
}

/// One backup or restore invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub timestamp: i64,
    pub kind: RunKind,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub state: OperationState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_never_return_to_processing() {
        let mut record = CategoryOperationRecord::new(DataCategory::UserData);
        assert!(record.transition(OperationState::Processing));
        assert!(record.transition(OperationState::Skip));
        assert!(!record.transition(OperationState::Processing));
        assert!(!record.transition(OperationState::Idle));
        assert_eq!(record.state, OperationState::Skip);
    }

    #[test]
    fn done_may_degrade_to_error_only() {
        let mut record = CategoryOperationRecord::new(DataCategory::DeviceData);
        record.transition(OperationState::Processing);
        record.transition(OperationState::Done);
        assert!(!record.transition(OperationState::Skip));
        assert!(record.transition(OperationState::Error));
        assert!(!record.transition(OperationState::Done));
    }

    #[test]
    fn overall_state_follows_errors() {
        let mut record = PackageOperationRecord::new(
            RecordKind::Package,
            "com.example.app",
            "Example",
            0,
            &DataCategory::ALL,
            0,
        );
        for sub in record.sub_records.iter_mut() {
            sub.transition(OperationState::Skip);
        }
        assert_eq!(record.compute_overall_state(), OperationState::Done);

        if let Some(sub) = record.sub_record_mut(DataCategory::ObbData) {
            sub.state = OperationState::Error;
        }
        assert_eq!(record.compute_overall_state(), OperationState::Error);
    }

    #[test]
    fn exit_codes_map_to_states() {
        assert_eq!(OperationState::from_exit_code(0), OperationState::Done);
        assert_eq!(OperationState::from_exit_code(EXIT_NOT_PRESENT), OperationState::Skip);
        assert_eq!(OperationState::from_exit_code(1), OperationState::Error);
        assert_eq!(OperationState::from_exit_code(-1), OperationState::Error);
    }

    #[test]
    fn log_lines_are_separated() {
        let mut record = CategoryOperationRecord::new(DataCategory::UserData);
        record.append_log("first");
        record.append_log("");
        record.append_log("second");
        assert_eq!(record.log_text, "first\nsecond");
    }
}
