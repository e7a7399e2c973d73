use std::path::Path;

use weft_core::config::WeftConfig;
use weft_core::graph::GraphDocument;
use weft_engine::{DataFlow, LockNetwork};
use weft_ops::OperationRegistry;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

impl CheckResult {
    fn pass(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Check a graph document against the registry and configuration. Prints
/// one line per check and returns the number of failed checks.
pub fn run_checks(path: &Path, registry: &OperationRegistry, config: &WeftConfig) -> usize {
    let mut checks = Vec::new();

    match GraphDocument::load(path) {
        Err(e) => checks.push(CheckResult::fail("Document", e.to_string())),
        Ok(document) => {
            checks.push(CheckResult::pass("Document", path.display().to_string()));
            check_document(&document, registry, config, &mut checks);
        }
    }

    let mut ok_count = 0;
    let mut fail_count = 0;
    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
    fail_count
}

fn check_document(
    document: &GraphDocument,
    registry: &OperationRegistry,
    config: &WeftConfig,
    checks: &mut Vec<CheckResult>,
) {
    let missing: Vec<&str> = document
        .operations
        .iter()
        .map(String::as_str)
        .filter(|name| registry.lookup(name).is_none())
        .collect();
    if !missing.is_empty() {
        checks.push(CheckResult::fail(
            "Operations",
            format!("not registered: {}", missing.join(", ")),
        ));
        return;
    }
    checks.push(CheckResult::pass(
        "Operations",
        format!("{} registered", document.operations.len()),
    ));

    let operations = document
        .operations
        .iter()
        .filter_map(|name| registry.lookup(name))
        .collect();
    let flow = match DataFlow::new(operations) {
        Ok(flow) => {
            checks.push(CheckResult::pass(
                "Definitions",
                format!("{} definitions", flow.definitions().len()),
            ));
            flow
        }
        Err(e) => {
            checks.push(CheckResult::fail("Definitions", e.to_string()));
            return;
        }
    };

    let flow = if document.flow.is_empty() {
        flow
    } else {
        match flow.with_routes(&document.flow) {
            Ok(flow) => {
                let routed: usize = document.flow.values().map(|params| params.len()).sum();
                checks.push(CheckResult::pass(
                    "Routes",
                    format!("{} routed parameters", routed),
                ));
                flow
            }
            Err(e) => {
                checks.push(CheckResult::fail("Routes", e.to_string()));
                return;
            }
        }
    };

    checks.push(check_seeds(document, &flow, config));
    checks.push(check_output_spec(document, &flow));
    checks.push(check_locks(&flow, config));
}

fn check_seeds(document: &GraphDocument, flow: &DataFlow, config: &WeftConfig) -> CheckResult {
    let mut bad = Vec::new();
    for seed in &document.seed {
        match flow.definitions().get(&seed.definition) {
            None => bad.push(format!("'{}' unknown", seed.definition)),
            Some(def) if config.orchestrator.validate_primitives => {
                if let Err(e) = def.check(&seed.value) {
                    bad.push(e.to_string());
                }
            }
            Some(_) => {}
        }
    }
    if !bad.is_empty() {
        return CheckResult::fail("Seeds", bad.join("; "));
    }
    let contexts = document.seeded_contexts().len();
    CheckResult::pass(
        "Seeds",
        format!("{} seeds, {} seeded contexts", document.seed.len(), contexts),
    )
}

fn check_output_spec(document: &GraphDocument, flow: &DataFlow) -> CheckResult {
    let unknown: Vec<&str> = document
        .output_spec
        .iter()
        .map(String::as_str)
        .filter(|name| !flow.definitions().contains(name))
        .collect();
    if unknown.is_empty() {
        CheckResult::pass("Output", format!("[{}]", document.output_spec.join(", ")))
    } else {
        CheckResult::fail("Output", format!("unknown definitions: {}", unknown.join(", ")))
    }
}

fn check_locks(flow: &DataFlow, config: &WeftConfig) -> CheckResult {
    let keys = flow.lock_keys();
    let network = LockNetwork::new(config.orchestrator.lock_order.clone());
    match network.validate(keys.iter().map(String::as_str)) {
        Ok(()) if keys.is_empty() => CheckResult::pass("Locks", "No shared resources"),
        Ok(()) => CheckResult::pass(
            "Locks",
            keys.into_iter().collect::<Vec<_>>().join(", "),
        ),
        Err(e) => CheckResult::fail("Locks", e.to_string()),
    }
}
