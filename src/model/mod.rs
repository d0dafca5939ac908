//! Bound data collaborators: instance documents, the multi-instance data
//! model and the expression evaluator interface.

mod data_model;
mod eval;
mod instance;

pub use data_model::{DataInstance, DataModel, InstanceHandle, NodeRef};
pub use eval::{BindingEvaluator, EvalContext, EvalError, EvalValue, PathEvaluator};
pub use instance::{DataError, DataNode, InstanceDocument, NodeId, NodeProps};
