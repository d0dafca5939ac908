use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::control::ITERATION_SEPARATOR;
use crate::error::{EngineError, Result};
use crate::model::InstanceDocument;
use crate::refresh::EventKind;

/// Static description of a form. Serialized, it is the static state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormDefinition {
    pub id: String,
    pub instances: Vec<InstanceDef>,
    pub root: ControlDef,
    #[serde(default)]
    pub listeners: Vec<ListenerDef>,
    #[serde(default)]
    pub namespaces: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDef {
    pub id: String,
    pub source: InstanceSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstanceSource {
    Inline {
        document: InstanceDocument,
    },
    /// Read-only instance loaded once and shared between documents.
    /// A negative `ttl_ms` never expires.
    Shared {
        uri: String,
        #[serde(default = "default_ttl")]
        ttl_ms: i64,
        #[serde(default)]
        handle_xinclude: bool,
    },
}

fn default_ttl() -> i64 {
    -1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlDef {
    pub id: String,
    pub kind: ControlDefKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ControlDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlDefKind {
    Group,
    Switch,
    Case {
        #[serde(default)]
        selected: bool,
    },
    Component,
    Input,
    Output,
    Trigger,
    Select {
        #[serde(default)]
        appearance: SelectAppearance,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        itemset: Option<String>,
    },
    Repeat {
        #[serde(default = "default_start_index")]
        start_index: u32,
    },
    Dialog {
        #[serde(default)]
        initially_open: bool,
    },
    Upload,
}

fn default_start_index() -> u32 {
    1
}

impl ControlDefKind {
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            ControlDefKind::Group
                | ControlDefKind::Switch
                | ControlDefKind::Case { .. }
                | ControlDefKind::Component
                | ControlDefKind::Repeat { .. }
                | ControlDefKind::Dialog { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ControlDefKind::Group => "group",
            ControlDefKind::Switch => "switch",
            ControlDefKind::Case { .. } => "case",
            ControlDefKind::Component => "component",
            ControlDefKind::Input => "input",
            ControlDefKind::Output => "output",
            ControlDefKind::Trigger => "trigger",
            ControlDefKind::Select { .. } => "select",
            ControlDefKind::Repeat { .. } => "repeat",
            ControlDefKind::Dialog { .. } => "dialog",
            ControlDefKind::Upload => "upload",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectAppearance {
    #[default]
    Minimal,
    Compact,
    Full,
}

/// A declared event handler. `observer: None` listens on every control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observer: Option<String>,
    pub event: EventKind,
}

impl ListenerDef {
    pub fn global(event: EventKind) -> Self {
        Self {
            observer: None,
            event,
        }
    }

    pub fn on(observer: impl Into<String>, event: EventKind) -> Self {
        Self {
            observer: Some(observer.into()),
            event,
        }
    }
}

impl ControlDef {
    pub fn new(id: impl Into<String>, kind: ControlDefKind) -> Self {
        Self {
            id: id.into(),
            kind,
            bind: None,
            children: Vec::new(),
        }
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::new(id, ControlDefKind::Group)
    }

    pub fn input(id: impl Into<String>, bind: impl Into<String>) -> Self {
        Self::new(id, ControlDefKind::Input).bind(bind)
    }

    pub fn output(id: impl Into<String>, bind: impl Into<String>) -> Self {
        Self::new(id, ControlDefKind::Output).bind(bind)
    }

    pub fn repeat(id: impl Into<String>, bind: impl Into<String>, start_index: u32) -> Self {
        Self::new(id, ControlDefKind::Repeat { start_index }).bind(bind)
    }

    pub fn bind(mut self, expr: impl Into<String>) -> Self {
        self.bind = Some(expr.into());
        self
    }

    pub fn child(mut self, child: ControlDef) -> Self {
        self.children.push(child);
        self
    }

    /// Pre-order walk over this definition and its descendants.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a ControlDef, Option<&'a ControlDef>)) {
        fn inner<'a>(
            def: &'a ControlDef,
            parent: Option<&'a ControlDef>,
            visit: &mut impl FnMut(&'a ControlDef, Option<&'a ControlDef>),
        ) {
            visit(def, parent);
            for child in &def.children {
                inner(child, Some(def), visit);
            }
        }
        inner(self, None, visit);
    }
}

impl FormDefinition {
    pub fn new(id: impl Into<String>, root: ControlDef) -> Self {
        Self {
            id: id.into(),
            instances: Vec::new(),
            root,
            listeners: Vec::new(),
            namespaces: BTreeMap::new(),
        }
    }

    pub fn with_instance(mut self, id: impl Into<String>, document: InstanceDocument) -> Self {
        self.instances.push(InstanceDef {
            id: id.into(),
            source: InstanceSource::Inline { document },
        });
        self
    }

    pub fn with_shared_instance(
        mut self,
        id: impl Into<String>,
        uri: impl Into<String>,
        ttl_ms: i64,
    ) -> Self {
        self.instances.push(InstanceDef {
            id: id.into(),
            source: InstanceSource::Shared {
                uri: uri.into(),
                ttl_ms,
                handle_xinclude: false,
            },
        });
        self
    }

    pub fn with_listener(mut self, listener: ListenerDef) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_namespace(mut self, prefix: impl Into<String>, uri: impl Into<String>) -> Self {
        self.namespaces.insert(prefix.into(), uri.into());
        self
    }

    /// Reject definitions that cannot produce a well-formed control tree.
    pub fn validate(&self) -> Result<()> {
        if self.instances.is_empty() {
            return Err(structural("a form needs at least one instance"));
        }
        let mut instance_ids = HashSet::new();
        for instance in &self.instances {
            if !instance_ids.insert(instance.id.as_str()) {
                return Err(structural(format!("duplicate instance id `{}`", instance.id)));
            }
        }
        if !matches!(self.root.kind, ControlDefKind::Group) {
            return Err(structural("the root control must be a group"));
        }

        let mut ids = HashSet::new();
        let mut problem: Option<String> = None;
        self.root.walk(&mut |def, parent| {
            if problem.is_some() {
                return;
            }
            problem = check_control(def, parent, &mut ids);
        });
        if let Some(message) = problem {
            return Err(structural(message));
        }

        for listener in &self.listeners {
            if let Some(observer) = &listener.observer {
                if !ids.contains(observer.as_str()) {
                    return Err(structural(format!(
                        "listener observes unknown control `{observer}`"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_control<'a>(
    def: &'a ControlDef,
    parent: Option<&ControlDef>,
    ids: &mut HashSet<&'a str>,
) -> Option<String> {
    if def.id.is_empty() || def.id.contains(ITERATION_SEPARATOR) {
        return Some(format!("invalid control id `{}`", def.id));
    }
    if !ids.insert(def.id.as_str()) {
        return Some(format!("duplicate control id `{}`", def.id));
    }
    if !def.kind.is_container() && !def.children.is_empty() {
        return Some(format!(
            "{} `{}` cannot contain other controls",
            def.kind.label(),
            def.id
        ));
    }
    let under_switch = parent.is_some_and(|p| matches!(p.kind, ControlDefKind::Switch));
    match &def.kind {
        ControlDefKind::Case { .. } if !under_switch => {
            Some(format!("case `{}` must be a direct child of a switch", def.id))
        }
        ControlDefKind::Switch if def.children.is_empty() => {
            Some(format!("switch `{}` has no cases", def.id))
        }
        ControlDefKind::Switch => def
            .children
            .iter()
            .find(|c| !matches!(c.kind, ControlDefKind::Case { .. }))
            .map(|c| format!("switch `{}` may only contain cases, found `{}`", def.id, c.id)),
        ControlDefKind::Repeat { .. } if def.bind.is_none() => {
            Some(format!("repeat `{}` requires a binding", def.id))
        }
        ControlDefKind::Input | ControlDefKind::Upload if def.bind.is_none() => {
            Some(format!("{} `{}` requires a binding", def.kind.label(), def.id))
        }
        _ => None,
    }
}

fn structural(message: impl Into<String>) -> EngineError {
    EngineError::Structural(message.into())
}
