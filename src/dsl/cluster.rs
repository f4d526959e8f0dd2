//! Module clustering and workflow orchestration.
//!
//! A validated program is cut into modules along top-level statement
//! boundaries (blocks are never split), each module becomes one Python step
//! function, and `orchestrate` emits the entry point that runs the steps in
//! dependency order over a shared context dict.

use std::collections::{BTreeSet, HashMap, HashSet};

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use super::analyzer::CallGraph;
use super::ast::*;
use super::error::{Defect, DefectKind};
use super::names;
use super::synth::{self, INDENT};

/// How top-level statements are grouped into modules.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    schemars::JsonSchema,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// A module ends after every statement that makes an external call.
    IoIsolation,
    /// A module ends after every control block.
    ControlFlow,
    /// Control blocks, plus top-level calls outside any block.
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Module {
    pub name: String,
    #[serde(skip)]
    pub statements: Vec<Stmt>,
    pub declared_inputs: Vec<String>,
    pub declared_outputs: Vec<String>,
    pub depends_on: Vec<String>,
    pub is_async: bool,
    /// Contains a `RETURN`; its result ends the workflow.
    pub terminal: bool,
    pub code: String,
}

impl Module {
    pub fn first_line(&self) -> Option<usize> {
        let mut first = None;
        walk(&self.statements, 0, &mut |s, _| {
            if first.is_none() && !s.span.is_synthetic() {
                first = Some(s.span.line);
            }
        });
        first
    }
}

/// Top-level `DEFINE`s that become entry-point defaults instead of code.
fn is_hoistable(stmt: &Stmt) -> bool {
    matches!(
        &stmt.kind,
        StmtKind::Define { initial_value, .. }
            if initial_value.as_ref().map_or(true, Expr::is_constant)
    )
}

/// Initial context values: upstream variable values, then hoisted
/// constant definitions (which win on a name clash).
pub fn defaults(statements: &[Stmt], upstream: &[Variable]) -> IndexMap<String, String> {
    let mut out = IndexMap::new();
    for var in upstream {
        out.insert(names::sanitize(&var.name), synth::python_value(&var.value));
    }
    for stmt in statements.iter().filter(|s| is_hoistable(s)) {
        if let StmtKind::Define {
            name,
            ty,
            initial_value,
        } = &stmt.kind
        {
            let value = initial_value.clone().unwrap_or_else(|| ty.default_value());
            out.insert(names::sanitize(name), synth::synthesize_expr(&value));
        }
    }
    out
}

/// Group a validated program into modules.
pub fn cluster(statements: &[Stmt], graph: &CallGraph, strategy: Strategy) -> Vec<Module> {
    let units = group(statements, strategy);

    let mut modules: Vec<Module> = Vec::with_capacity(units.len());
    let mut site_owner: HashMap<usize, usize> = HashMap::new();
    for (index, unit) in units.into_iter().enumerate() {
        let terminal = contains_return(&unit);
        let (inputs, outputs) = interface(&unit);
        let declared_outputs = if terminal { Vec::new() } else { outputs };

        let mut depends: BTreeSet<usize> = BTreeSet::new();
        for input in &inputs {
            if let Some(producer) = modules
                .iter()
                .rposition(|m| m.declared_outputs.contains(input))
            {
                depends.insert(producer);
            }
        }
        let own_sites = sites_in(&unit, graph);
        for &site in &own_sites {
            site_owner.insert(site, index);
        }
        for &site in &own_sites {
            for callee in graph.callees(site) {
                if let Some(&owner) = site_owner.get(&callee) {
                    if owner != index {
                        depends.insert(owner);
                    }
                }
            }
        }

        let name = module_name(index + 1, &unit, &declared_outputs);
        let is_async = contains_call(&unit);
        let depends_on = depends
            .iter()
            .filter_map(|&i| modules.get(i).map(|m: &Module| m.name.clone()))
            .collect();
        let mut module = Module {
            name,
            statements: unit,
            declared_inputs: inputs,
            declared_outputs,
            depends_on,
            is_async,
            terminal,
            code: String::new(),
        };
        module.code = module_code(&module);
        modules.push(module);
    }
    modules
}

/// Cut the top-level statements into units. Everything from the first
/// statement containing a `RETURN` onwards is one unit.
fn group(statements: &[Stmt], strategy: Strategy) -> Vec<Vec<Stmt>> {
    let mut units = Vec::new();
    let mut current: Vec<Stmt> = Vec::new();
    let mut terminal = false;
    for stmt in statements.iter().filter(|s| !is_hoistable(s)) {
        terminal |= contains_return(std::slice::from_ref(stmt));
        let makes_call = contains_call(std::slice::from_ref(stmt));
        let split = !terminal
            && match strategy {
                Strategy::IoIsolation => makes_call,
                Strategy::ControlFlow => stmt.is_block(),
                Strategy::Hybrid => stmt.is_block() || makes_call,
            };
        current.push(stmt.clone());
        if split {
            units.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        units.push(current);
    }
    units
}

/// Inputs and outputs of a unit, in first-appearance order.
///
/// An input is a variable read before any unconditional write in the unit.
/// Variables written only inside blocks are inputs too, so their prior value
/// flows through when the block does not run.
fn interface(unit: &[Stmt]) -> (Vec<String>, Vec<String>) {
    let mut inputs: IndexSet<String> = IndexSet::new();
    let mut written = HashSet::new();
    reads_before_writes(unit, &mut written, &mut inputs);

    let mut loop_vars = HashSet::new();
    let mut outputs: IndexSet<String> = IndexSet::new();
    walk(unit, 0, &mut |s, _| {
        if let StmtKind::For { loop_var, .. } = &s.kind {
            loop_vars.insert(names::sanitize(loop_var));
        }
        if let Some(name) = s.own_write() {
            outputs.insert(names::sanitize(name));
        }
    });
    outputs.retain(|name| !loop_vars.contains(name));
    for name in &outputs {
        if !written.contains(name) {
            inputs.insert(name.clone());
        }
    }
    inputs.retain(|name| !loop_vars.contains(name) || outputs.contains(name));
    (inputs.into_iter().collect(), outputs.into_iter().collect())
}

fn reads_before_writes(stmts: &[Stmt], written: &mut HashSet<String>, inputs: &mut IndexSet<String>) {
    for stmt in stmts {
        for name in stmt.own_reads() {
            let name = names::sanitize(name);
            if !written.contains(&name) {
                inputs.insert(name);
            }
        }
        if let Some(name) = stmt.own_write() {
            written.insert(names::sanitize(name));
        }
        for block in stmt.blocks() {
            // Writes inside a block are visible only within it.
            let mut inner = written.clone();
            if let StmtKind::For { loop_var, .. } = &stmt.kind {
                inner.insert(names::sanitize(loop_var));
            }
            reads_before_writes(block, &mut inner, inputs);
        }
    }
}

fn sites_in(unit: &[Stmt], graph: &CallGraph) -> Vec<usize> {
    let mut out = Vec::new();
    walk(unit, 0, &mut |s, _| {
        for (span, ordinal, _) in s.own_calls() {
            out.extend(graph.site_id(span, ordinal));
        }
    });
    out
}

fn module_name(number: usize, unit: &[Stmt], outputs: &[String]) -> String {
    let mut first_call = None;
    walk(unit, 0, &mut |s, _| {
        if first_call.is_none() {
            first_call = s.own_calls().first().map(|(_, _, c)| c.function_name.clone());
        }
    });
    if let Some(function) = first_call {
        format!("step_{number}_{}", names::function_slug(&function))
    } else if let Some(output) = outputs.first() {
        format!("step_{number}_compute_{}", output.to_lowercase())
    } else {
        format!("step_{number}_process")
    }
}

fn module_code(module: &Module) -> String {
    let keyword = if module.is_async { "async def" } else { "def" };
    let mut out = format!(
        "{keyword} {}({}):\n",
        module.name,
        module.declared_inputs.join(", ")
    );
    if let Some(line) = module.first_line() {
        out.push_str(&format!("{INDENT}\"\"\"Generated from line {line}.\"\"\"\n"));
    }
    out.push_str(&synth::synthesize_block(&module.statements, 1));
    if !module.terminal && !module.declared_outputs.is_empty() {
        let entries: Vec<String> = module
            .declared_outputs
            .iter()
            .map(|o| format!("\"{o}\": {o}"))
            .collect();
        out.push_str(&format!("{INDENT}return {{{}}}\n", entries.join(", ")));
    }
    out
}

/// Emit the `main_workflow` entry point. Steps run in a topological order
/// of `depends_on`, ties broken by source order; a dependency cycle between
/// modules is reported as a `CyclicDependency` defect.
pub fn orchestrate(modules: &[Module], defaults: &IndexMap<String, String>) -> Result<String, Defect> {
    let order = module_order(modules)?;

    let mut out = String::from("async def main_workflow(input_params: dict):\n");
    out.push_str(&format!(
        "{INDENT}\"\"\"Run every step in dependency order over a shared context.\"\"\"\n"
    ));
    if defaults.is_empty() {
        out.push_str(&format!("{INDENT}defaults = {{}}\n"));
    } else {
        out.push_str(&format!("{INDENT}defaults = {{\n"));
        for (name, value) in defaults {
            out.push_str(&format!("{INDENT}{INDENT}\"{name}\": {value},\n"));
        }
        out.push_str(&format!("{INDENT}}}\n"));
    }
    out.push_str(&format!("{INDENT}ctx = {{**defaults, **input_params}}\n"));

    for module in order.iter().filter_map(|&i| modules.get(i)) {
        let args: Vec<String> = module
            .declared_inputs
            .iter()
            .map(|input| format!("ctx.get(\"{input}\")"))
            .collect();
        let await_kw = if module.is_async { "await " } else { "" };
        let invocation = format!("{await_kw}{}({})", module.name, args.join(", "));
        if module.terminal {
            out.push_str(&format!("{INDENT}result = {invocation}\n"));
            out.push_str(&format!("{INDENT}if result is not None:\n"));
            out.push_str(&format!("{INDENT}{INDENT}return result\n"));
        } else if module.declared_outputs.is_empty() {
            out.push_str(&format!("{INDENT}{invocation}\n"));
        } else {
            out.push_str(&format!("{INDENT}ctx.update({invocation})\n"));
        }
    }
    out.push_str(&format!("{INDENT}return ctx\n"));
    Ok(out)
}

/// Kahn's algorithm over module dependencies.
pub fn module_order(modules: &[Module]) -> Result<Vec<usize>, Defect> {
    let index: HashMap<&str, usize> = modules
        .iter()
        .enumerate()
        .map(|(i, m)| (m.name.as_str(), i))
        .collect();
    let mut indegree = vec![0usize; modules.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); modules.len()];
    for (i, module) in modules.iter().enumerate() {
        for dep in &module.depends_on {
            if let Some(&d) = index.get(dep.as_str()) {
                if let Some(slot) = indegree.get_mut(i) {
                    *slot += 1;
                }
                if let Some(list) = dependents.get_mut(d) {
                    list.push(i);
                }
            }
        }
    }
    let mut ready: BTreeSet<usize> = indegree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(modules.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in dependents.get(next).map_or(&[][..], Vec::as_slice) {
            if let Some(slot) = indegree.get_mut(dependent) {
                *slot -= 1;
                if *slot == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }
    if order.len() == modules.len() {
        return Ok(order);
    }
    let stuck: Vec<&str> = modules
        .iter()
        .enumerate()
        .filter(|(i, _)| !order.contains(i))
        .map(|(_, m)| m.name.as_str())
        .collect();
    Err(Defect::error(
        DefectKind::CyclicDependency,
        SourceSpan::synthetic(),
        format!("modules depend on each other: {}", stuck.join(", ")),
    ))
}

/// Render a complete Python file.
pub fn export_program(modules: &[Module], entry_point: &str) -> String {
    let mut out = String::from(
        "\"\"\"\nGenerated by logicforge. Do not edit by hand.\n\"\"\"\n\nimport asyncio\n\nfrom llm_client import invoke_function\n\n\n",
    );
    out.push_str(&format!(
        "def {}(value):\n{INDENT}\"\"\"Interpret a function result as a condition.\"\"\"\n\
         {INDENT}if isinstance(value, str):\n\
         {INDENT}{INDENT}return value.strip().lower() in (\"true\", \"yes\", \"1\")\n\
         {INDENT}return bool(value)\n",
        synth::BOOL_ADAPTOR
    ));
    for module in modules {
        out.push_str("\n\n");
        out.push_str(&module.code);
    }
    out.push_str("\n\n");
    out.push_str(entry_point);
    out.push_str("\n\nif __name__ == \"__main__\":\n");
    out.push_str(&format!("{INDENT}print(asyncio.run(main_workflow({{}})))\n"));
    out
}
