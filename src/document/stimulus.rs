use serde::{Deserialize, Serialize};

use crate::control::UploadInfo;

/// A client-originated change applied to a form document. Controls and
/// repeats are addressed by effective id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Stimulus {
    SetValue {
        control: String,
        value: String,
    },
    Activate {
        control: String,
    },
    /// Insert a copy of the last node of the repeat's collection after
    /// 1-based `after`; `0` inserts at the front, `None` at the end.
    Insert {
        repeat: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<u32>,
    },
    Delete {
        repeat: String,
        position: u32,
    },
    SetIndex {
        repeat: String,
        index: u32,
    },
    Focus {
        control: String,
    },
    SelectCase {
        switch: String,
        case: String,
    },
    OpenDialog {
        dialog: String,
    },
    CloseDialog {
        dialog: String,
    },
    Upload {
        control: String,
        file: UploadInfo,
        /// Value stored in the bound node, typically a resource locator.
        value: String,
    },
    /// Outcome of a submission started by an earlier response.
    SubmissionResult {
        submission: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Stimulus {
    pub fn name(&self) -> &'static str {
        match self {
            Stimulus::SetValue { .. } => "set_value",
            Stimulus::Activate { .. } => "activate",
            Stimulus::Insert { .. } => "insert",
            Stimulus::Delete { .. } => "delete",
            Stimulus::SetIndex { .. } => "set_index",
            Stimulus::Focus { .. } => "focus",
            Stimulus::SelectCase { .. } => "select_case",
            Stimulus::OpenDialog { .. } => "open_dialog",
            Stimulus::CloseDialog { .. } => "close_dialog",
            Stimulus::Upload { .. } => "upload",
            Stimulus::SubmissionResult { .. } => "submission_result",
        }
    }
}
