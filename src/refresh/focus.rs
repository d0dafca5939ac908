use crate::control::{ControlTree, EffectiveId};

/// Tracks which control holds focus on the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FocusTracker {
    focused: Option<EffectiveId>,
    last: Option<EffectiveId>,
}

/// Outcome of checking the focused control against the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FocusCheck {
    Kept,
    /// Focus was cleared; the control still exists and gets a focus-out.
    Lost(EffectiveId),
    /// Focus was cleared; the control is gone.
    Removed(EffectiveId),
}

impl FocusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(focused: Option<EffectiveId>) -> Self {
        Self {
            last: focused.clone(),
            focused,
        }
    }

    pub fn set_focus(&mut self, id: EffectiveId) {
        self.last = Some(id.clone());
        self.focused = Some(id);
    }

    /// Clear focus, but only when `id` holds it.
    pub fn clear_focus(&mut self, id: &EffectiveId) -> bool {
        if self.focused.as_ref() == Some(id) {
            self.focused = None;
            return true;
        }
        false
    }

    pub fn current(&self) -> Option<&EffectiveId> {
        self.focused.as_ref()
    }

    pub fn last(&self) -> Option<&EffectiveId> {
        self.last.as_ref()
    }

    /// Drop focus when the focused control disappeared or is no longer
    /// relevant.
    pub fn reconcile(&mut self, tree: &ControlTree) -> FocusCheck {
        let Some(id) = self.focused.clone() else {
            return FocusCheck::Kept;
        };
        match tree.find(&id) {
            Some(control) if control.is_relevant() => FocusCheck::Kept,
            Some(_) => {
                self.focused = None;
                FocusCheck::Lost(id)
            }
            None => {
                self.focused = None;
                FocusCheck::Removed(id)
            }
        }
    }
}
