use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use super::data_model::{DataModel, NodeRef};

#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Nodes(Vec<NodeRef>),
    Scalar(String),
}

impl EvalValue {
    pub fn into_nodes(self) -> Option<Vec<NodeRef>> {
        match self {
            EvalValue::Nodes(nodes) => Some(nodes),
            EvalValue::Scalar(_) => None,
        }
    }
}

/// Everything an expression may depend on besides the data model.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub node: NodeRef,
    /// 1-based position of `node` in the enclosing node-set.
    pub position: usize,
    pub namespaces: &'a BTreeMap<String, String>,
    pub variables: &'a HashMap<String, EvalValue>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("syntax error in `{expr}`: {reason}")]
    Syntax { expr: String, reason: String },
    #[error("unknown instance `{0}`")]
    UnknownInstance(String),
    #[error("unbound variable `${0}`")]
    UnboundVariable(String),
    #[error("unbound namespace prefix `{0}`")]
    UnboundPrefix(String),
}

/// Expression evaluation collaborator. Implementations must be deterministic
/// for a given model state and context.
pub trait BindingEvaluator: Send + Sync {
    fn evaluate(
        &self,
        model: &DataModel,
        expr: &str,
        ctx: &EvalContext<'_>,
    ) -> Result<EvalValue, EvalError>;
}

/// Minimal path language used by tests and simple forms:
/// `.`, `..`, `*`, `name`, `prefix:name`, `name[n]`, absolute `/root/a`,
/// `instance('id')/a`, string literals and `$variables`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathEvaluator;

impl PathEvaluator {
    pub fn new() -> Self {
        Self
    }
}

enum Start {
    /// Above the root element of an instance, as after a leading `/`.
    Document(usize),
    Nodes(Vec<NodeRef>),
}

impl BindingEvaluator for PathEvaluator {
    fn evaluate(
        &self,
        model: &DataModel,
        expr: &str,
        ctx: &EvalContext<'_>,
    ) -> Result<EvalValue, EvalError> {
        let expr = expr.trim();
        let syntax = |reason: &str| EvalError::Syntax {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        if expr.is_empty() {
            return Err(syntax("empty expression"));
        }
        if let Some(literal) = string_literal(expr) {
            return Ok(EvalValue::Scalar(literal.to_string()));
        }
        if let Some(name) = expr.strip_prefix('$') {
            return ctx
                .variables
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::UnboundVariable(name.to_string()));
        }
        if expr.starts_with(|c: char| c.is_ascii_digit() || c == '-') && expr.parse::<f64>().is_ok()
        {
            return Ok(EvalValue::Scalar(expr.to_string()));
        }

        let (start, rest) = if let Some(after) = expr.strip_prefix("instance(") {
            let close = after.find(')').ok_or_else(|| syntax("unclosed instance()"))?;
            let id = string_literal(after[..close].trim())
                .ok_or_else(|| syntax("instance() expects a string literal"))?;
            let index = model
                .instance_index(id)
                .ok_or_else(|| EvalError::UnknownInstance(id.to_string()))?;
            let root = model
                .root_of(index)
                .ok_or_else(|| EvalError::UnknownInstance(id.to_string()))?;
            let rest = &after[close + 1..];
            let rest = match rest.strip_prefix('/') {
                Some(r) => r,
                None if rest.is_empty() => rest,
                None => return Err(syntax("expected `/` after instance()")),
            };
            (Start::Nodes(vec![root]), rest)
        } else if let Some(rest) = expr.strip_prefix('/') {
            (Start::Document(ctx.node.instance), rest)
        } else {
            (Start::Nodes(vec![ctx.node]), expr)
        };

        let mut current = match start {
            Start::Nodes(nodes) => nodes,
            Start::Document(instance) => {
                let root = model
                    .root_of(instance)
                    .ok_or_else(|| EvalError::UnknownInstance(instance.to_string()))?;
                if rest.is_empty() {
                    return Ok(EvalValue::Nodes(vec![root]));
                }
                let mut steps = rest.splitn(2, '/');
                let first = steps.next().unwrap_or_default();
                let (name, predicate) = parse_step(first, ctx, &syntax)?;
                let root_name = model.node(root).map(|n| n.name.as_str());
                let matches = name == "*" || root_name == Some(name.as_str());
                let selected = if matches && predicate.is_none_or(|p| p == 1) {
                    vec![root]
                } else {
                    Vec::new()
                };
                match steps.next() {
                    Some(remaining) => return walk(model, selected, remaining, ctx, &syntax),
                    None => return Ok(EvalValue::Nodes(selected)),
                }
            }
        };

        if rest.is_empty() {
            current.dedup();
            return Ok(EvalValue::Nodes(current));
        }
        walk(model, current, rest, ctx, &syntax)
    }
}

fn walk(
    model: &DataModel,
    mut current: Vec<NodeRef>,
    path: &str,
    ctx: &EvalContext<'_>,
    syntax: &dyn Fn(&str) -> EvalError,
) -> Result<EvalValue, EvalError> {
    for step in path.split('/') {
        let step = step.trim();
        if step.is_empty() {
            return Err(syntax("empty step"));
        }
        let mut next = Vec::new();
        match step {
            "." => next = current,
            ".." => {
                for node in current {
                    if let Some(parent) = model.parent(node) {
                        if !next.contains(&parent) {
                            next.push(parent);
                        }
                    }
                }
            }
            _ => {
                let (name, predicate) = parse_step(step, ctx, syntax)?;
                for node in current {
                    let Some(doc) = model.document(node.instance) else {
                        continue;
                    };
                    let matching: Vec<NodeRef> = doc
                        .children(node.node)
                        .iter()
                        .filter(|c| {
                            name == "*" || doc.node(**c).is_some_and(|n| n.name == name)
                        })
                        .map(|c| NodeRef::new(node.instance, *c))
                        .collect();
                    match predicate {
                        Some(p) => next.extend(matching.get(p - 1).copied()),
                        None => next.extend(matching),
                    }
                }
            }
        }
        current = next;
    }
    Ok(EvalValue::Nodes(current))
}

fn parse_step(
    step: &str,
    ctx: &EvalContext<'_>,
    syntax: &dyn Fn(&str) -> EvalError,
) -> Result<(String, Option<usize>), EvalError> {
    let (name, predicate) = match step.find('[') {
        Some(open) => {
            let inner = step[open + 1..]
                .strip_suffix(']')
                .ok_or_else(|| syntax("unclosed predicate"))?;
            let position: usize = inner
                .trim()
                .parse()
                .map_err(|_| syntax("only numeric predicates are supported"))?;
            if position == 0 {
                return Err(syntax("positions are 1-based"));
            }
            (&step[..open], Some(position))
        }
        None => (step, None),
    };
    let local = match name.split_once(':') {
        Some((prefix, local)) => {
            if !ctx.namespaces.contains_key(prefix) {
                return Err(EvalError::UnboundPrefix(prefix.to_string()));
            }
            local
        }
        None => name,
    };
    if local.is_empty() || !local.chars().all(|c| c.is_alphanumeric() || "_-.*".contains(c)) {
        return Err(syntax("invalid name test"));
    }
    Ok((local.to_string(), predicate))
}

fn string_literal(expr: &str) -> Option<&str> {
    let quote = expr.chars().next()?;
    if (quote == '\'' || quote == '"') && expr.len() >= 2 && expr.ends_with(quote) {
        Some(&expr[1..expr.len() - 1])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstanceDocument;

    fn model() -> DataModel {
        let mut doc = InstanceDocument::new("order");
        let root = doc.root();
        let items = doc.append(root, "items", "").unwrap();
        for qty in ["1", "2", "3"] {
            let item = doc.append(items, "item", "").unwrap();
            doc.append(item, "qty", qty).unwrap();
        }
        let mut lookup = InstanceDocument::new("codes");
        let lroot = lookup.root();
        lookup.append(lroot, "code", "A").unwrap();
        let mut model = DataModel::new();
        model.add_owned("main", doc);
        model.add_owned("lookup", lookup);
        model
    }

    fn eval(model: &DataModel, expr: &str) -> Result<EvalValue, EvalError> {
        let namespaces = BTreeMap::from([("f".to_string(), "urn:form".to_string())]);
        let variables = HashMap::from([("v".to_string(), EvalValue::Scalar("x".to_string()))]);
        let ctx = EvalContext {
            node: model.default_root().unwrap(),
            position: 1,
            namespaces: &namespaces,
            variables: &variables,
        };
        PathEvaluator.evaluate(model, expr, &ctx)
    }

    fn values(model: &DataModel, result: EvalValue) -> Vec<String> {
        result
            .into_nodes()
            .unwrap()
            .into_iter()
            .map(|n| model.value(n).unwrap().to_string())
            .collect()
    }

    #[test]
    fn relative_and_absolute_paths_agree() {
        let model = model();
        let rel = eval(&model, "items/item/qty").unwrap();
        let abs = eval(&model, "/order/items/item/qty").unwrap();
        assert_eq!(rel, abs);
        assert_eq!(values(&model, rel), vec!["1", "2", "3"]);
    }

    #[test]
    fn predicates_select_by_position() {
        let model = model();
        let result = eval(&model, "items/item[2]/qty").unwrap();
        assert_eq!(values(&model, result), vec!["2"]);
        assert!(eval(&model, "items/item[0]").is_err());
    }

    #[test]
    fn instance_function_switches_documents() {
        let model = model();
        let result = eval(&model, "instance('lookup')/code").unwrap();
        assert_eq!(values(&model, result), vec!["A"]);
        assert_eq!(
            eval(&model, "instance('missing')/code"),
            Err(EvalError::UnknownInstance("missing".to_string()))
        );
    }

    #[test]
    fn literals_and_variables_are_scalars() {
        let model = model();
        assert_eq!(eval(&model, "'hi'").unwrap(), EvalValue::Scalar("hi".to_string()));
        assert_eq!(eval(&model, "$v").unwrap(), EvalValue::Scalar("x".to_string()));
        assert!(matches!(eval(&model, "$nope"), Err(EvalError::UnboundVariable(_))));
    }

    #[test]
    fn prefixes_must_be_bound() {
        let model = model();
        assert!(eval(&model, "f:items").is_ok());
        assert_eq!(
            eval(&model, "g:items"),
            Err(EvalError::UnboundPrefix("g".to_string()))
        );
    }

    #[test]
    fn parent_steps_deduplicate() {
        let model = model();
        let result = eval(&model, "items/item/..").unwrap();
        assert_eq!(result.into_nodes().unwrap().len(), 1);
    }
}
