use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::form::SelectAppearance;
use crate::model::NodeRef;

/// Separates the static id from the iteration positions in an effective id.
pub const ITERATION_SEPARATOR: char = '·';
const POSITION_SEPARATOR: char = '-';

/// Identity of a control in a live tree: its static id plus the 1-based
/// positions of every enclosing repeat iteration, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct EffectiveId {
    static_id: String,
    positions: Vec<u32>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid effective id `{0}`")]
pub struct ParseEffectiveIdError(String);

impl EffectiveId {
    pub fn new(static_id: impl Into<String>) -> Self {
        Self {
            static_id: static_id.into(),
            positions: Vec::new(),
        }
    }

    pub fn with_positions(static_id: impl Into<String>, positions: Vec<u32>) -> Self {
        Self {
            static_id: static_id.into(),
            positions,
        }
    }

    pub fn static_id(&self) -> &str {
        &self.static_id
    }

    pub fn positions(&self) -> &[u32] {
        &self.positions
    }

    pub fn depth(&self) -> usize {
        self.positions.len()
    }

    /// Same static id, one more nesting level.
    pub fn iteration(&self, position: u32) -> Self {
        let mut positions = self.positions.clone();
        positions.push(position);
        Self::with_positions(self.static_id.clone(), positions)
    }

    pub(crate) fn set_position(&mut self, level: usize, position: u32) {
        if let Some(slot) = self.positions.get_mut(level) {
            *slot = position;
        }
    }
}

impl fmt::Display for EffectiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.static_id)?;
        if let Some((first, rest)) = self.positions.split_first() {
            write!(f, "{ITERATION_SEPARATOR}{first}")?;
            for p in rest {
                write!(f, "{POSITION_SEPARATOR}{p}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for EffectiveId {
    type Err = ParseEffectiveIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseEffectiveIdError(s.to_string());
        let (static_id, suffix) = match s.split_once(ITERATION_SEPARATOR) {
            Some((id, suffix)) => (id, Some(suffix)),
            None => (s, None),
        };
        if static_id.is_empty() {
            return Err(invalid());
        }
        let positions = match suffix {
            Some(suffix) => suffix
                .split(POSITION_SEPARATOR)
                .map(|p| p.parse::<u32>().ok().filter(|p| *p > 0))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(invalid)?,
            None => Vec::new(),
        };
        Ok(Self::with_positions(static_id, positions))
    }
}

impl From<EffectiveId> for String {
    fn from(id: EffectiveId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for EffectiveId {
    type Error = ParseEffectiveIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A value with its last committed form and its current form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracked<T> {
    committed: T,
    current: T,
}

impl<T: Clone + PartialEq> Tracked<T> {
    pub fn new(value: T) -> Self {
        Self {
            committed: value.clone(),
            current: value,
        }
    }

    pub fn current(&self) -> &T {
        &self.current
    }

    pub fn committed(&self) -> &T {
        &self.committed
    }

    pub fn set(&mut self, value: T) {
        self.current = value;
    }

    pub fn changed(&self) -> bool {
        self.committed != self.current
    }

    pub fn commit(&mut self) {
        if self.changed() {
            self.committed = self.current.clone();
        }
    }
}

/// State computed from binding and data, tracked against the last commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlState {
    pub relevant: Tracked<bool>,
    pub readonly: Tracked<bool>,
    pub required: Tracked<bool>,
    pub valid: Tracked<bool>,
    pub value: Tracked<Option<String>>,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            relevant: Tracked::new(false),
            readonly: Tracked::new(false),
            required: Tracked::new(false),
            valid: Tracked::new(true),
            value: Tracked::new(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatedState {
    pub relevant: bool,
    pub readonly: bool,
    pub required: bool,
    pub valid: bool,
    pub value: Option<String>,
}

impl ControlState {
    pub fn apply(&mut self, evaluated: EvaluatedState) {
        self.relevant.set(evaluated.relevant);
        self.readonly.set(evaluated.readonly);
        self.required.set(evaluated.required);
        self.valid.set(evaluated.valid);
        self.value.set(evaluated.value);
    }

    pub fn commit(&mut self) {
        self.relevant.commit();
        self.readonly.commit();
        self.required.commit();
        self.valid.commit();
        self.value.commit();
    }

    pub fn is_dirty(&self) -> bool {
        self.relevant.changed()
            || self.readonly.changed()
            || self.required.changed()
            || self.valid.changed()
            || self.value.changed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Binding {
    pub context: Option<NodeRef>,
    pub nodes: Vec<NodeRef>,
    /// 1-based position of the context node in its node-set.
    pub position: usize,
    /// Data model revision the binding was computed against.
    pub revision: u64,
    /// Result of a scalar binding, only allowed on outputs.
    pub scalar: Option<String>,
    pub failed: bool,
}

impl Binding {
    /// Single-node controls bind to the first node of the node-set.
    pub fn node(&self) -> Option<NodeRef> {
        self.nodes.first().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInfo {
    pub filename: String,
    pub mediatype: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFlavor {
    Input,
    Output,
    Trigger,
    Select(SelectAppearance),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerFlavor {
    Group,
    Switch { selected_case: String },
    Case,
    Component,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatState {
    /// 1-based selected iteration, 0 exactly when there are no iterations.
    pub index: u32,
    pub size: u32,
    pub start_index: u32,
}

impl RepeatState {
    pub fn clamp(&mut self) {
        self.index = clamp_index(self.index, self.size);
    }
}

/// Clamp `index` into `[1, size]`, or 0 for an empty repeat.
pub fn clamp_index(index: u32, size: u32) -> u32 {
    if size == 0 { 0 } else { index.clamp(1, size) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlKind {
    Value { flavor: ValueFlavor, items: Vec<Item> },
    Container(ContainerFlavor),
    Repeat(RepeatState),
    Iteration { position: u32 },
    Dialog { visible: bool },
    Upload(Option<UploadInfo>),
}

/// Kinds the index keeps in their own ordered sub-mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexedKind {
    Upload,
    Repeat,
    Dialog,
    SelectFull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlInstance {
    id: EffectiveId,
    pub kind: ControlKind,
    pub binding: Binding,
    pub state: ControlState,
    committed_positions: Vec<u32>,
}

impl ControlInstance {
    pub fn new(id: EffectiveId, kind: ControlKind, binding: Binding) -> Self {
        let committed_positions = id.positions().to_vec();
        Self {
            id,
            kind,
            binding,
            state: ControlState::default(),
            committed_positions,
        }
    }

    pub fn id(&self) -> &EffectiveId {
        &self.id
    }

    pub fn static_id(&self) -> &str {
        self.id.static_id()
    }

    pub(crate) fn id_mut(&mut self) -> &mut EffectiveId {
        &mut self.id
    }

    pub fn is_relevant(&self) -> bool {
        *self.state.relevant.current()
    }

    pub fn value(&self) -> Option<&str> {
        self.state.value.current().as_deref()
    }

    pub fn indexed_kind(&self) -> Option<IndexedKind> {
        match &self.kind {
            ControlKind::Upload(_) => Some(IndexedKind::Upload),
            ControlKind::Repeat(_) => Some(IndexedKind::Repeat),
            ControlKind::Dialog { .. } => Some(IndexedKind::Dialog),
            ControlKind::Value {
                flavor: ValueFlavor::Select(SelectAppearance::Full),
                ..
            } => Some(IndexedKind::SelectFull),
            _ => None,
        }
    }

    pub fn repeat(&self) -> Option<&RepeatState> {
        match &self.kind {
            ControlKind::Repeat(state) => Some(state),
            _ => None,
        }
    }

    pub fn repeat_mut(&mut self) -> Option<&mut RepeatState> {
        match &mut self.kind {
            ControlKind::Repeat(state) => Some(state),
            _ => None,
        }
    }

    pub fn iteration_position(&self) -> Option<u32> {
        match self.kind {
            ControlKind::Iteration { position } => Some(position),
            _ => None,
        }
    }

    /// Whether value-changed applies to this kind of control.
    pub fn holds_value(&self) -> bool {
        matches!(
            self.kind,
            ControlKind::Value {
                flavor: ValueFlavor::Input | ValueFlavor::Output | ValueFlavor::Select(_),
                ..
            } | ControlKind::Upload(_)
        )
    }

    pub fn items(&self) -> &[Item] {
        match &self.kind {
            ControlKind::Value { items, .. } => items,
            _ => &[],
        }
    }

    /// Whether the control moved to another iteration position since the
    /// last commit.
    pub fn moved(&self) -> bool {
        self.committed_positions != self.id.positions()
    }

    /// Whether the control's own iteration position changed since the last
    /// commit. Shifts of enclosing iterations alone do not count.
    pub fn trailing_moved(&self) -> bool {
        self.committed_positions.last() != self.id.positions().last()
    }

    pub fn commit(&mut self) {
        self.state.commit();
        if self.moved() {
            self.committed_positions = self.id.positions().to_vec();
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.state.is_dirty() || self.moved()
    }
}
