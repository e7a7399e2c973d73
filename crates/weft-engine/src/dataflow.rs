use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use weft_core::definition::DefinitionRegistry;
use weft_core::error::{Result, WeftError};
use weft_core::graph::{GraphDocument, Routes, SeedInput};
use weft_core::traits::Implementation;
use weft_core::types::{ContextId, Input, Operation, Source};
use weft_ops::registry::{OperationRegistry, RegisteredOperation};

/// A validated set of operations with their implementations, the
/// definitions they connect through, flow-wide seeds and the output
/// specification.
pub struct DataFlow {
    operations: Vec<RegisteredOperation>,
    definitions: Arc<DefinitionRegistry>,
    seed: Vec<SeedInput>,
    output_spec: Vec<String>,
}

impl DataFlow {
    /// Build a flow from registered operations. Checks that operation
    /// names are unique, that every definition name has one primitive, and
    /// that `expand`, `optional`, `sources` and `expand_outputs` name real
    /// parameters.
    pub fn new(operations: Vec<RegisteredOperation>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for entry in &operations {
            let op = &entry.operation;
            if !seen.insert(op.name.as_str()) {
                return Err(WeftError::Graph(format!(
                    "operation '{}' listed more than once",
                    op.name
                )));
            }
            check_parameter_names(op)?;
        }
        let definitions =
            DefinitionRegistry::from_operations(operations.iter().map(|e| e.operation.as_ref()))?;
        Ok(Self {
            operations,
            definitions: Arc::new(definitions),
            seed: vec![],
            output_spec: vec![],
        })
    }

    /// Resolve a decoded graph document against an operation registry.
    pub fn resolve(document: &GraphDocument, registry: &OperationRegistry) -> Result<Self> {
        let operations = document
            .operations
            .iter()
            .map(|name| registry.require(name))
            .collect::<Result<Vec<_>>>()?;
        let flow = Self::new(operations)?
            .with_routes(&document.flow)?
            .with_seed(document.seed.clone())
            .with_output_spec(document.output_spec.clone());
        flow.validate()?;
        Ok(flow)
    }

    /// Restrict operation parameters to the given sources. Replaces any
    /// sources the operation already declared for a routed parameter.
    pub fn with_routes(mut self, routes: &Routes) -> Result<Self> {
        for (name, params) in routes {
            let entry = self
                .operations
                .iter_mut()
                .find(|e| &e.operation.name == name)
                .ok_or_else(|| {
                    WeftError::Graph(format!("flow routes unknown operation '{}'", name))
                })?;
            let operation = Arc::make_mut(&mut entry.operation);
            for (param, sources) in params {
                operation.sources.insert(param.clone(), sources.clone());
            }
            check_parameter_names(operation)?;
        }
        self.check_sources()?;
        Ok(self)
    }

    pub fn with_seed(mut self, seed: Vec<SeedInput>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_output_spec<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_spec = names.into_iter().map(Into::into).collect();
        self
    }

    /// Check seeds and the output specification against the definitions.
    pub fn validate(&self) -> Result<()> {
        for seed in &self.seed {
            self.definitions.require(&seed.definition)?;
        }
        for name in &self.output_spec {
            self.definitions.require(name)?;
        }
        self.check_sources()
    }

    /// Every `operation.output` source names an output of this flow.
    fn check_sources(&self) -> Result<()> {
        for entry in &self.operations {
            let op = &entry.operation;
            for (param, sources) in &op.sources {
                for source in sources {
                    let Source::Output { operation, output } = source else {
                        continue;
                    };
                    let known = self.operations.iter().any(|e| {
                        &e.operation.name == operation && e.operation.outputs.contains_key(output)
                    });
                    if !known {
                        return Err(WeftError::Graph(format!(
                            "parameter '{}' of '{}' is routed from '{}', which is not an output in this flow",
                            param, op.name, source
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn operations(&self) -> Vec<Arc<Operation>> {
        self.operations.iter().map(|e| e.operation.clone()).collect()
    }

    pub fn operation(&self, name: &str) -> Option<Arc<Operation>> {
        self.operations
            .iter()
            .find(|e| e.operation.name == name)
            .map(|e| e.operation.clone())
    }

    pub fn implementations(&self) -> HashMap<String, Arc<dyn Implementation>> {
        self.operations
            .iter()
            .map(|e| (e.operation.name.clone(), e.implementation.clone()))
            .collect()
    }

    pub fn definitions(&self) -> &Arc<DefinitionRegistry> {
        &self.definitions
    }

    pub fn seed(&self) -> &[SeedInput] {
        &self.seed
    }

    pub fn output_spec(&self) -> &[String] {
        &self.output_spec
    }

    /// Every resource key any implementation declares.
    pub fn lock_keys(&self) -> BTreeSet<String> {
        self.operations
            .iter()
            .flat_map(|e| e.implementation.locks())
            .collect()
    }

    /// Contexts named by seeds, with flow-wide seeds applied to each.
    pub fn seeded_contexts(&self) -> Vec<(ContextId, Vec<SeedInput>)> {
        let mut contexts: Vec<ContextId> = Vec::new();
        for ctx in self.seed.iter().filter_map(|s| s.context.as_ref()) {
            if !contexts.contains(ctx) {
                contexts.push(ctx.clone());
            }
        }
        contexts
            .into_iter()
            .map(|ctx| {
                let seeds = self.seeds_for(&ctx, &[]);
                (ctx, seeds)
            })
            .collect()
    }

    /// Flow-wide seeds, then seeds targeted at `context`, then `extra`.
    pub fn seeds_for(&self, context: &ContextId, extra: &[SeedInput]) -> Vec<SeedInput> {
        self.seed
            .iter()
            .filter(|s| s.context.is_none())
            .chain(self.seed.iter().filter(|s| s.context.as_ref() == Some(context)))
            .chain(extra.iter())
            .cloned()
            .collect()
    }

    /// Turn seeds into Inputs carrying registered definitions.
    pub fn seed_inputs(&self, seeds: &[SeedInput]) -> Result<Vec<Input>> {
        seeds
            .iter()
            .map(|s| {
                let definition = self.definitions.require(&s.definition)?;
                Ok(Input::seed(definition, s.value.clone()))
            })
            .collect()
    }
}

fn check_parameter_names(op: &Operation) -> Result<()> {
    for param in op
        .expand
        .iter()
        .chain(op.optional.iter())
        .chain(op.sources.keys())
    {
        if !op.inputs.contains_key(param) {
            return Err(WeftError::Graph(format!(
                "operation '{}' has no input parameter '{}'",
                op.name, param
            )));
        }
    }
    for output in &op.expand_outputs {
        if !op.outputs.contains_key(output) {
            return Err(WeftError::Graph(format!(
                "operation '{}' has no output '{}'",
                op.name, output
            )));
        }
    }
    Ok(())
}
