use std::collections::{HashMap, HashSet};

use super::definition::{ControlDef, FormDefinition};
use crate::refresh::EventKind;

/// Which event kinds have handlers, computed once per form.
///
/// The refresh engine consults this before generating notifications so that
/// forms without handlers never pay for event construction.
#[derive(Debug, Clone, Default)]
pub struct ListenerAnalysis {
    any_observer: HashSet<EventKind>,
    global: HashSet<EventKind>,
    by_observer: HashMap<String, HashSet<EventKind>>,
}

impl ListenerAnalysis {
    pub fn analyze(form: &FormDefinition) -> Self {
        let mut analysis = Self::default();
        for listener in &form.listeners {
            analysis.any_observer.insert(listener.event);
            match &listener.observer {
                Some(observer) => {
                    analysis
                        .by_observer
                        .entry(observer.clone())
                        .or_default()
                        .insert(listener.event);
                }
                None => {
                    analysis.global.insert(listener.event);
                }
            }
        }
        analysis
    }

    /// Whether any handler, on any control, listens for `kind`.
    pub fn has_listener(&self, kind: EventKind) -> bool {
        self.any_observer.contains(&kind)
    }

    /// Whether a handler observes `kind` on the control with `static_id`.
    pub fn has_listener_for(&self, static_id: &str, kind: EventKind) -> bool {
        self.global.contains(&kind)
            || self
                .by_observer
                .get(static_id)
                .is_some_and(|kinds| kinds.contains(&kind))
    }

    /// Whether refresh notifications need to be generated at all.
    pub fn has_refresh_listeners(&self) -> bool {
        EventKind::REFRESH.iter().any(|k| self.has_listener(*k))
    }
}

/// Static-id lookup into a form definition.
#[derive(Debug)]
pub struct StaticIndex<'a> {
    defs: HashMap<&'a str, &'a ControlDef>,
}

impl<'a> StaticIndex<'a> {
    pub fn new(form: &'a FormDefinition) -> Self {
        let mut defs = HashMap::new();
        form.root.walk(&mut |def, _| {
            defs.insert(def.id.as_str(), def);
        });
        Self { defs }
    }

    pub fn get(&self, static_id: &str) -> Option<&'a ControlDef> {
        self.defs.get(static_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::ListenerDef;
    use crate::model::InstanceDocument;

    fn form(listeners: Vec<ListenerDef>) -> FormDefinition {
        let root = ControlDef::group("root").child(ControlDef::input("name", "name"));
        let mut form =
            FormDefinition::new("f", root).with_instance("main", InstanceDocument::new("data"));
        form.listeners = listeners;
        form
    }

    #[test]
    fn empty_form_has_no_refresh_listeners() {
        let analysis = ListenerAnalysis::analyze(&form(Vec::new()));
        assert!(!analysis.has_refresh_listeners());
        assert!(!analysis.has_listener(EventKind::Enabled));
    }

    #[test]
    fn observer_specific_listeners_are_scoped() {
        let analysis =
            ListenerAnalysis::analyze(&form(vec![ListenerDef::on("name", EventKind::ValueChanged)]));
        assert!(analysis.has_refresh_listeners());
        assert!(analysis.has_listener(EventKind::ValueChanged));
        assert!(analysis.has_listener_for("name", EventKind::ValueChanged));
        assert!(!analysis.has_listener_for("other", EventKind::ValueChanged));
    }

    #[test]
    fn global_listeners_apply_everywhere() {
        let analysis = ListenerAnalysis::analyze(&form(vec![ListenerDef::global(
            EventKind::IterationMoved,
        )]));
        assert!(analysis.has_listener_for("anything", EventKind::IterationMoved));
    }

    #[test]
    fn activation_listeners_do_not_enable_refresh_dispatch() {
        let analysis =
            ListenerAnalysis::analyze(&form(vec![ListenerDef::on("name", EventKind::Activate)]));
        assert!(!analysis.has_refresh_listeners());
    }

    #[test]
    fn static_index_finds_nested_definitions() {
        let form = form(Vec::new());
        let index = StaticIndex::new(&form);
        assert_eq!(index.get("name").map(|d| d.id.as_str()), Some("name"));
        assert!(index.get("missing").is_none());
    }
}
