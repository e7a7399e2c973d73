use std::sync::Arc;

use serde_json::Value;

use weft_core::config::BindingPolicy;
use weft_core::traits::InputView;
use weft_core::types::{Binding, ContextId, Operation, ParameterSet, Stage};

/// An operation paired with one concrete binding of its parameters.
#[derive(Debug, Clone)]
pub struct ReadyOperation {
    pub operation: Arc<Operation>,
    pub parameters: ParameterSet,
}

/// Decides which operations can run in a context right now.
pub struct OperationNetwork {
    operations: Vec<Arc<Operation>>,
    binding: BindingPolicy,
}

impl OperationNetwork {
    pub fn new(operations: Vec<Arc<Operation>>, binding: BindingPolicy) -> Self {
        Self {
            operations,
            binding,
        }
    }

    pub fn operations(&self) -> &[Arc<Operation>] {
        &self.operations
    }

    pub fn binding(&self) -> BindingPolicy {
        self.binding
    }

    /// Every condition definition has at least one truthy Input.
    pub fn conditions_met(&self, operation: &Operation, view: &dyn InputView) -> bool {
        operation
            .conditions
            .iter()
            .all(|c| view.inputs(&c.name).iter().any(|i| i.is_truthy()))
    }

    /// Candidate bindings for each parameter, or `None` when a required
    /// parameter has nothing to bind to. Inputs from sources a parameter is
    /// not routed from are skipped.
    fn candidates(
        &self,
        operation: &Operation,
        view: &dyn InputView,
    ) -> Option<Vec<(String, Vec<Binding>)>> {
        let mut per_param = Vec::with_capacity(operation.inputs.len());
        for (param, definition) in &operation.inputs {
            let mut available = view.inputs(&definition.name);
            available.retain(|input| operation.accepts(param, input));
            let optional = operation.optional.contains(param);

            let choices = if operation.expand.contains(param) {
                if available.is_empty() && !optional {
                    return None;
                }
                vec![Binding::Many(available)]
            } else if available.is_empty() {
                if !optional {
                    return None;
                }
                vec![Binding::Default(
                    definition.default.clone().unwrap_or(Value::Null),
                )]
            } else {
                match self.binding {
                    BindingPolicy::MostRecent => {
                        available.last().cloned().map(Binding::One).into_iter().collect()
                    }
                    BindingPolicy::AllCombinations => {
                        available.into_iter().map(Binding::One).collect()
                    }
                }
            };
            per_param.push((param.clone(), choices));
        }
        Some(per_param)
    }

    /// Every parameter set `operation` can run with in `context`. An
    /// operation with no parameters yields one empty set.
    pub fn parameter_sets(
        &self,
        context: &ContextId,
        operation: &Operation,
        view: &dyn InputView,
    ) -> Vec<ParameterSet> {
        if !self.conditions_met(operation, view) {
            return vec![];
        }
        let Some(per_param) = self.candidates(operation, view) else {
            return vec![];
        };

        let mut sets = vec![ParameterSet::new(context.clone(), operation.name.clone())];
        for (param, choices) in per_param {
            let mut next = Vec::with_capacity(sets.len() * choices.len());
            for set in &sets {
                for choice in &choices {
                    next.push(set.clone().bind(param.clone(), choice.clone()));
                }
            }
            sets = next;
        }
        sets
    }

    /// Ready work among processing-stage operations.
    pub fn operations_for(
        &self,
        context: &ContextId,
        view: &dyn InputView,
    ) -> Vec<ReadyOperation> {
        self.operations_for_stage(context, view, Stage::Processing)
    }

    pub fn operations_for_stage(
        &self,
        context: &ContextId,
        view: &dyn InputView,
        stage: Stage,
    ) -> Vec<ReadyOperation> {
        self.operations
            .iter()
            .filter(|op| op.stage == stage)
            .flat_map(|op| {
                self.parameter_sets(context, op, view)
                    .into_iter()
                    .map(|parameters| ReadyOperation {
                        operation: op.clone(),
                        parameters,
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::types::{Input, Origin, Source};
    use weft_test_utils::{bool_def, int_def, MemoryView};

    fn ctx() -> ContextId {
        ContextId::from("c")
    }

    fn add_op() -> Arc<Operation> {
        Arc::new(
            Operation::new("add")
                .input("a", int_def("a"))
                .input("b", int_def("b"))
                .output("sum", int_def("sum")),
        )
    }

    #[test]
    fn test_needs_every_required_parameter() {
        let net = OperationNetwork::new(vec![add_op()], BindingPolicy::MostRecent);
        let view = MemoryView::new();
        view.add(Input::seed(int_def("a"), json!(40)));
        assert!(net.operations_for(&ctx(), &view).is_empty());

        view.add(Input::seed(int_def("b"), json!(2)));
        let ready = net.operations_for(&ctx(), &view);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].parameters.values()["a"], json!(40));
    }

    #[test]
    fn test_most_recent_binding() {
        let net = OperationNetwork::new(vec![add_op()], BindingPolicy::MostRecent);
        let view = MemoryView::new();
        view.add(Input::seed(int_def("a"), json!(1)));
        view.add(Input::seed(int_def("a"), json!(2)));
        view.add(Input::seed(int_def("b"), json!(3)));

        let ready = net.operations_for(&ctx(), &view);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].parameters.values()["a"], json!(2));
    }

    #[test]
    fn test_all_combinations_binding() {
        let net = OperationNetwork::new(vec![add_op()], BindingPolicy::AllCombinations);
        let view = MemoryView::new();
        view.add(Input::seed(int_def("a"), json!(1)));
        view.add(Input::seed(int_def("a"), json!(2)));
        view.add(Input::seed(int_def("b"), json!(10)));
        view.add(Input::seed(int_def("b"), json!(20)));

        let mut pairs: Vec<(i64, i64)> = net
            .operations_for(&ctx(), &view)
            .iter()
            .map(|r| {
                let v = r.parameters.values();
                (v["a"].as_i64().unwrap(), v["b"].as_i64().unwrap())
            })
            .collect();
        pairs.sort();
        assert_eq!(pairs, vec![(1, 10), (1, 20), (2, 10), (2, 20)]);
    }

    #[test]
    fn test_expand_binds_all() {
        let op = Arc::new(
            Operation::new("total")
                .input("values", int_def("n"))
                .expand("values"),
        );
        let net = OperationNetwork::new(vec![op], BindingPolicy::MostRecent);
        let view = MemoryView::new();
        assert!(net.operations_for(&ctx(), &view).is_empty());

        view.add(Input::seed(int_def("n"), json!(1)));
        view.add(Input::seed(int_def("n"), json!(2)));
        let ready = net.operations_for(&ctx(), &view);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].parameters.values()["values"], json!([1, 2]));
    }

    #[test]
    fn test_optional_parameters() {
        let op = Arc::new(
            Operation::new("greet")
                .input("name", weft_test_utils::str_def("name"))
                .input("times", int_def("times").with_default(json!(1)))
                .input("extra", int_def("extra"))
                .optional("times")
                .optional("extra")
                .expand("extra"),
        );
        let net = OperationNetwork::new(vec![op], BindingPolicy::MostRecent);
        let view = MemoryView::new();
        view.add(Input::seed(weft_test_utils::str_def("name"), json!("x")));

        let ready = net.operations_for(&ctx(), &view);
        assert_eq!(ready.len(), 1);
        let values = ready[0].parameters.values();
        assert_eq!(values["times"], json!(1));
        assert_eq!(values["extra"], json!([]));
    }

    #[test]
    fn test_routed_parameter_skips_other_sources() {
        let op = Arc::new(
            Operation::new("show")
                .input("n", int_def("n"))
                .source("n", Source::Seed),
        );
        let net = OperationNetwork::new(vec![op], BindingPolicy::MostRecent);
        let view = MemoryView::new();
        let seeded = view.add(Input::seed(int_def("n"), json!(1)));
        view.add(Input::derived(
            int_def("n"),
            json!(2),
            vec![seeded.uid.clone()],
            Origin {
                operation: "inc".into(),
                output: "n".into(),
            },
        ));

        let ready = net.operations_for(&ctx(), &view);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].parameters.values()["n"], json!(1));

        let op = Arc::new(
            Operation::new("show")
                .input("n", int_def("n"))
                .source("n", Source::output("double", "n")),
        );
        let net = OperationNetwork::new(vec![op], BindingPolicy::MostRecent);
        assert!(net.operations_for(&ctx(), &view).is_empty());
    }

    #[test]
    fn test_condition_gating() {
        let op = Arc::new(
            Operation::new("deploy")
                .input("a", int_def("a"))
                .condition(bool_def("approved")),
        );
        let net = OperationNetwork::new(vec![op], BindingPolicy::MostRecent);
        let view = MemoryView::new();
        view.add(Input::seed(int_def("a"), json!(1)));
        assert!(net.operations_for(&ctx(), &view).is_empty());

        view.add(Input::seed(bool_def("approved"), json!(false)));
        assert!(net.operations_for(&ctx(), &view).is_empty());

        view.add(Input::seed(bool_def("approved"), json!(true)));
        assert_eq!(net.operations_for(&ctx(), &view).len(), 1);
    }

    #[test]
    fn test_auto_start_and_stages() {
        let start = Arc::new(Operation::new("start").output("a", int_def("a")));
        let out = Arc::new(Operation::new("report").stage(Stage::Output));
        let net = OperationNetwork::new(vec![start, out], BindingPolicy::MostRecent);
        let view = MemoryView::new();

        let ready = net.operations_for(&ctx(), &view);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].operation.name, "start");
        assert!(ready[0].parameters.bindings.is_empty());

        let output = net.operations_for_stage(&ctx(), &view, Stage::Output);
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].operation.name, "report");
    }
}
