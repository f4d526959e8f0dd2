//! Symbol and dependency analysis: definition table, usage set and the call
//! graph, with duplicate, undefined and cycle detection.

use std::collections::{BTreeSet, HashMap, HashSet};

use indexmap::{IndexMap, IndexSet};

use super::ast::*;
use super::error::{Defect, DefectKind};

/// One `CALL` occurrence. Two calls of the same function are distinct sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    pub function: String,
    pub span: SourceSpan,
    /// Position among the calls on the same line.
    pub ordinal: usize,
}

/// Directed graph over call sites. An edge `caller -> callee` means the
/// caller's invocation consumes a value produced by the callee.
#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    sites: Vec<CallSite>,
    index: HashMap<(SourceSpan, usize), usize>,
    edges: BTreeSet<(usize, usize)>,
}

impl CallGraph {
    pub fn sites(&self) -> &[CallSite] {
        &self.sites
    }

    pub fn site(&self, id: usize) -> Option<&CallSite> {
        self.sites.get(id)
    }

    pub fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.edges.iter().copied()
    }

    /// Sites with no edge in or out, in site order. Empty when the graph has
    /// no edges at all: independent calls are only suspicious next to a flow.
    pub fn isolated_sites(&self) -> Vec<usize> {
        let linked: HashSet<usize> = self.edges.iter().flat_map(|&(a, b)| [a, b]).collect();
        if linked.is_empty() {
            return Vec::new();
        }
        (0..self.sites.len()).filter(|id| !linked.contains(id)).collect()
    }

    pub fn site_id(&self, span: SourceSpan, ordinal: usize) -> Option<usize> {
        self.index.get(&(span, ordinal)).copied()
    }

    fn intern(&mut self, span: SourceSpan, ordinal: usize, function: &str) -> usize {
        if let Some(&id) = self.index.get(&(span, ordinal)) {
            return id;
        }
        let id = self.sites.len();
        self.sites.push(CallSite {
            function: function.to_string(),
            span,
            ordinal,
        });
        self.index.insert((span, ordinal), id);
        id
    }

    /// Self-edges are dropped: a call feeding its own next invocation inside a
    /// loop is an accumulator, not a dependency cycle.
    fn add_edge(&mut self, caller: usize, callee: usize) {
        if caller != callee {
            self.edges.insert((caller, callee));
        }
    }

    pub fn callees(&self, id: usize) -> impl Iterator<Item = usize> + '_ {
        self.edges
            .range((id, 0)..=(id, usize::MAX))
            .map(|&(_, callee)| callee)
    }

    /// Every elementary cycle reachable by DFS, each rotated to start at its
    /// smallest site id and closed by repeating that id.
    pub fn find_cycles(&self) -> Vec<Vec<usize>> {
        let mut state = vec![Visit::New; self.sites.len()];
        let mut stack = Vec::new();
        let mut seen = HashSet::new();
        let mut cycles = Vec::new();
        for start in 0..self.sites.len() {
            if state.get(start) == Some(&Visit::New) {
                self.dfs(start, &mut state, &mut stack, &mut seen, &mut cycles);
            }
        }
        cycles
    }

    fn dfs(
        &self,
        node: usize,
        state: &mut Vec<Visit>,
        stack: &mut Vec<usize>,
        seen: &mut HashSet<Vec<usize>>,
        cycles: &mut Vec<Vec<usize>>,
    ) {
        state[node] = Visit::OnStack;
        stack.push(node);
        for next in self.callees(node) {
            match state[next] {
                Visit::New => self.dfs(next, state, stack, seen, cycles),
                Visit::OnStack => {
                    if let Some(pos) = stack.iter().position(|&n| n == next) {
                        let mut cycle: Vec<usize> = stack[pos..].to_vec();
                        if let Some(min_pos) = cycle
                            .iter()
                            .enumerate()
                            .min_by_key(|&(_, id)| *id)
                            .map(|(i, _)| i)
                        {
                            cycle.rotate_left(min_pos);
                        }
                        if seen.insert(cycle.clone()) {
                            if let Some(&first) = cycle.first() {
                                cycle.push(first);
                            }
                            cycles.push(cycle);
                        }
                    }
                }
                Visit::Done => {}
            }
        }
        stack.pop();
        state[node] = Visit::Done;
    }

    /// Kahn's algorithm, callees before callers, ties broken by first
    /// appearance. `None` if the graph has a cycle.
    pub fn topological_order(&self) -> Option<Vec<usize>> {
        let n = self.sites.len();
        let mut pending = vec![0usize; n];
        let mut callers: Vec<Vec<usize>> = vec![Vec::new(); n];
        for &(caller, callee) in &self.edges {
            pending[caller] += 1;
            callers[callee].push(caller);
        }
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &caller in &callers[next] {
                pending[caller] -= 1;
                if pending[caller] == 0 {
                    ready.insert(caller);
                }
            }
        }
        (order.len() == n).then_some(order)
    }

    pub fn describe_path(&self, path: &[usize]) -> String {
        path.iter()
            .filter_map(|&id| self.site(id).map(|s| s.function.as_str()))
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    OnStack,
    Done,
}

/// Everything the validator and later stages need to know about names and calls.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    /// Variable name to its first `DEFINE`.
    pub definitions: IndexMap<String, SourceSpan>,
    /// Declared types: `DEFINE`s, upstream variables, loop variables (`Any`).
    pub types: HashMap<String, VarType>,
    /// Every referenced variable with the span of its first use.
    pub usages: IndexMap<String, SourceSpan>,
    pub loop_vars: IndexSet<String>,
    pub upstream: IndexSet<String>,
    pub call_graph: CallGraph,
    pub defects: Vec<Defect>,
}

impl Analysis {
    pub fn is_defined(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
            || self.loop_vars.contains(name)
            || self.upstream.contains(name)
    }

    pub fn type_of(&self, name: &str) -> Option<VarType> {
        self.types.get(name).copied()
    }
}

/// Build the definition table, usage set and call graph for a statement tree.
pub fn analyze(statements: &[Stmt], upstream: &[Variable]) -> Analysis {
    let mut analysis = Analysis::default();
    for var in upstream {
        if !analysis.upstream.insert(var.name.clone()) {
            analysis.defects.push(
                Defect::error(
                    DefectKind::DuplicateDefinition,
                    SourceSpan::synthetic(),
                    format!("upstream variable `{}` is listed more than once", var.name),
                )
                .with_subject(var.name.clone()),
            );
        }
        analysis.types.insert(var.name.clone(), var.ty);
    }

    collect_symbols(statements, &mut analysis);

    let undefined: Vec<Defect> = analysis
        .usages
        .iter()
        .filter(|(name, _)| !analysis.is_defined(name))
        .map(|(name, span)| {
            Defect::error(
                DefectKind::UndefinedVariable,
                *span,
                format!("`{name}` is used but never defined"),
            )
            .with_subject(name.clone())
        })
        .collect();
    analysis.defects.extend(undefined);

    let mut flow = Flow {
        graph: &mut analysis.call_graph,
    };
    let mut env = Env::new();
    flow.block(statements, &mut env);

    let cycles = analysis.call_graph.find_cycles();
    for cycle in cycles {
        let span = cycle
            .first()
            .and_then(|&id| analysis.call_graph.site(id))
            .map_or(SourceSpan::synthetic(), |s| s.span);
        let path = analysis.call_graph.describe_path(&cycle);
        analysis.defects.push(Defect::error(
            DefectKind::CyclicDependency,
            span,
            format!("cyclic dependency: {path}"),
        ));
    }
    analysis
}

fn collect_symbols(statements: &[Stmt], analysis: &mut Analysis) {
    walk(statements, 0, &mut |stmt, _| {
        for name in stmt.own_reads() {
            analysis
                .usages
                .entry(name.to_string())
                .or_insert(stmt.span);
        }
        match &stmt.kind {
            StmtKind::Define { name, ty, .. } => {
                if let Some(first) = analysis.definitions.get(name) {
                    analysis.defects.push(
                        Defect::error(
                            DefectKind::DuplicateDefinition,
                            stmt.span,
                            format!("`{name}` is already defined on line {}", first.line),
                        )
                        .with_subject(name.clone()),
                    );
                } else {
                    analysis.definitions.insert(name.clone(), stmt.span);
                    analysis.types.insert(name.clone(), *ty);
                }
            }
            StmtKind::Assign { target: name, .. }
            | StmtKind::Call {
                result_binding: Some(name),
                ..
            } => {
                analysis
                    .usages
                    .entry(name.clone())
                    .or_insert(stmt.span);
            }
            StmtKind::For { loop_var, .. } => {
                analysis.loop_vars.insert(loop_var.clone());
                analysis
                    .types
                    .entry(loop_var.clone())
                    .or_insert(VarType::Any);
            }
            StmtKind::Call { .. }
            | StmtKind::If { .. }
            | StmtKind::While { .. }
            | StmtKind::Return { .. } => {}
        }
    });
}

// ── Data flow ──────────────────────────────────────────────────────

/// Call sites whose results may reach a variable's current value.
type Taint = BTreeSet<usize>;
type Env = HashMap<String, Taint>;

fn merge_into(env: &mut Env, other: &Env) {
    for (name, taint) in other {
        env.entry(name.clone()).or_default().extend(taint.iter().copied());
    }
}

struct Flow<'g> {
    graph: &'g mut CallGraph,
}

impl Flow<'_> {
    fn block(&mut self, stmts: &[Stmt], env: &mut Env) {
        for stmt in stmts {
            self.stmt(stmt, env);
        }
    }

    fn stmt(&mut self, stmt: &Stmt, env: &mut Env) {
        let span = stmt.span;
        match &stmt.kind {
            StmtKind::Define {
                name,
                initial_value,
                ..
            } => {
                let taint = initial_value
                    .as_ref()
                    .map(|e| self.eval(e, span, &mut 0, env))
                    .unwrap_or_default();
                env.insert(name.clone(), taint);
            }
            StmtKind::Assign { target, expression } => {
                let taint = self.eval(expression, span, &mut 0, env);
                env.insert(target.clone(), taint);
            }
            StmtKind::Call {
                result_binding,
                call,
            } => {
                let id = self.call(call, span, &mut 0, env);
                if let Some(binding) = result_binding {
                    env.insert(binding.clone(), Taint::from([id]));
                }
            }
            StmtKind::If {
                condition,
                then_branch,
                elif_branches,
                else_branch,
                ..
            } => {
                self.eval(condition, span, &mut 0, env);
                let mut merged = env.clone();
                self.block(then_branch, &mut merged);
                for branch in elif_branches {
                    self.eval(&branch.condition, branch.span, &mut 0, env);
                    let mut branch_env = env.clone();
                    self.block(&branch.body, &mut branch_env);
                    merge_into(&mut merged, &branch_env);
                }
                if let Some(body) = else_branch {
                    let mut branch_env = env.clone();
                    self.block(body, &mut branch_env);
                    merge_into(&mut merged, &branch_env);
                } else {
                    merge_into(&mut merged, env);
                }
                *env = merged;
            }
            StmtKind::For {
                loop_var,
                iterable,
                body,
                ..
            } => {
                let items = self.eval(iterable, span, &mut 0, env);
                // Iterate to a fixpoint so loop-carried values reach their consumers.
                loop {
                    let before = env.clone();
                    let mut body_env = env.clone();
                    body_env.insert(loop_var.clone(), items.clone());
                    self.block(body, &mut body_env);
                    merge_into(env, &body_env);
                    if *env == before {
                        break;
                    }
                }
            }
            StmtKind::While {
                condition, body, ..
            } => loop {
                let before = env.clone();
                self.eval(condition, span, &mut 0, env);
                let mut body_env = env.clone();
                self.block(body, &mut body_env);
                merge_into(env, &body_env);
                if *env == before {
                    break;
                }
            },
            StmtKind::Return { expression } => {
                if let Some(e) = expression {
                    self.eval(e, span, &mut 0, env);
                }
            }
        }
    }

    /// Register a call site (before its arguments, matching `Stmt::own_calls`)
    /// and connect it to every site whose result flows into an argument.
    fn call(&mut self, call: &CallExpr, span: SourceSpan, ordinal: &mut usize, env: &Env) -> usize {
        let id = self.graph.intern(span, *ordinal, &call.function_name);
        *ordinal += 1;
        for arg in &call.arguments {
            let taint = self.eval(&arg.value, span, ordinal, env);
            for source in taint {
                self.graph.add_edge(id, source);
            }
        }
        id
    }

    fn eval(&mut self, expr: &Expr, span: SourceSpan, ordinal: &mut usize, env: &Env) -> Taint {
        match expr {
            Expr::Literal(_) | Expr::Unparsed { .. } => Taint::new(),
            Expr::Var(name) => env.get(name).cloned().unwrap_or_default(),
            Expr::List(items) => {
                let mut out = Taint::new();
                for item in items {
                    out.extend(self.eval(item, span, ordinal, env));
                }
                out
            }
            Expr::Dict(entries) => {
                let mut out = Taint::new();
                for (k, v) in entries {
                    out.extend(self.eval(k, span, ordinal, env));
                    out.extend(self.eval(v, span, ordinal, env));
                }
                out
            }
            Expr::Unary { operand, .. } => self.eval(operand, span, ordinal, env),
            Expr::Binary { left, right, .. } => {
                let mut out = self.eval(left, span, ordinal, env);
                out.extend(self.eval(right, span, ordinal, env));
                out
            }
            Expr::Call(call) => Taint::from([self.call(call, span, ordinal, env)]),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::dsl::parser::parse;
    use pretty_assertions::assert_eq;

    fn run(src: &str) -> Analysis {
        run_with(src, &[])
    }

    fn run_with(src: &str, upstream: &[Variable]) -> Analysis {
        let (stmts, defects) = parse(src);
        assert!(defects.is_empty(), "parse defects: {defects:?}");
        analyze(&stmts, upstream)
    }

    fn kinds(a: &Analysis) -> Vec<DefectKind> {
        a.defects.iter().map(|d| d.kind).collect()
    }

    fn order_names(a: &Analysis) -> Vec<String> {
        a.call_graph
            .topological_order()
            .unwrap()
            .into_iter()
            .map(|id| a.call_graph.sites()[id].function.clone())
            .collect()
    }

    #[test]
    fn duplicate_definitions_keep_first_span() {
        let a = run("DEFINE {{d}}: Integer = 90\nDEFINE {{d}}: Integer = 30\nDEFINE {{d}}: Integer = 7");
        assert_eq!(a.definitions.len(), 1);
        assert_eq!(a.definitions["d"].line, 1);
        assert_eq!(kinds(&a), vec![DefectKind::DuplicateDefinition; 2]);
        assert_eq!(a.defects[0].span.line, 2);
        assert_eq!(a.defects[1].subject.as_deref(), Some("d"));
    }

    #[test]
    fn undefined_variables_respect_upstream_and_loop_vars() {
        let upstream = vec![Variable {
            name: "threshold".into(),
            ty: VarType::Integer,
            value: serde_json::json!(10),
            origin_text: "at least 10".into(),
        }];
        let a = run_with(
            "FOR {{row}} IN {{rows}}\n  IF {{row}} > {{threshold}}\n    {{hits}} = {{hits}} + 1\n  ENDIF\nENDFOR",
            &upstream,
        );
        let undefined: Vec<_> = a.defects.iter().filter_map(|d| d.subject.as_deref()).collect();
        assert_eq!(undefined, vec!["rows", "hits"]);
        assert_eq!(a.type_of("threshold"), Some(VarType::Integer));
        assert_eq!(a.type_of("row"), Some(VarType::Any));
    }

    #[test]
    fn nested_call_is_an_edge() {
        let a = run("CALL outer(CALL inner())");
        let sites = a.call_graph.sites();
        assert_eq!(sites[0].function, "outer");
        assert_eq!(sites[1].function, "inner");
        assert_eq!(a.call_graph.edges().collect::<Vec<_>>(), vec![(0, 1)]);
        assert_eq!(order_names(&a), vec!["inner", "outer"]);
    }

    #[test]
    fn data_flow_through_variables() {
        let a = run("DEFINE {{r}}: Any\n{{r}} = CALL fetch()\n{{s}} = {{r}} + 1\nCALL store({{s}})");
        assert_eq!(a.call_graph.edges().collect::<Vec<_>>(), vec![(1, 0)]);
        assert_eq!(order_names(&a), vec!["fetch", "store"]);
    }

    #[test]
    fn branches_merge() {
        let src = "DEFINE {{a}}: Any\nIF {{x}}\n  {{a}} = CALL f()\nELSE\n  {{a}} = CALL h()\nENDIF\nCALL k({{a}})";
        let a = run_with(
            src,
            &[Variable {
                name: "x".into(),
                ty: VarType::Boolean,
                value: serde_json::Value::Null,
                origin_text: String::new(),
            }],
        );
        let edges: Vec<_> = a.call_graph.edges().collect();
        assert_eq!(edges, vec![(2, 0), (2, 1)]);
    }

    #[test]
    fn repeated_function_is_not_a_cycle() {
        let a = run("DEFINE {{a}}: Any\nDEFINE {{b}}: Any\n{{a}} = CALL f(1)\n{{b}} = CALL g({{a}})\nCALL f({{b}})");
        assert!(a.defects.is_empty(), "{:?}", a.defects);
        assert_eq!(order_names(&a), vec!["f", "g", "f"]);
    }

    #[test]
    fn loop_accumulator_is_not_a_cycle() {
        let a = run("DEFINE {{total}}: Integer = 0\nFOR {{i}} IN [1, 2]\n  {{total}} = CALL add({{total}}, {{i}})\nENDFOR");
        assert!(a.defects.is_empty());
        assert!(a.call_graph.topological_order().is_some());
    }

    #[test]
    fn mutual_loop_dependency_is_a_cycle() {
        let src = "DEFINE {{a}}: Any\nDEFINE {{b}}: Any\nWHILE True\n  {{a}} = CALL f({{b}})\n  {{b}} = CALL g({{a}})\nENDWHILE";
        let a = run(src);
        assert_eq!(kinds(&a), vec![DefectKind::CyclicDependency]);
        assert_eq!(a.defects[0].message, "cyclic dependency: f -> g -> f");
        assert_eq!(a.defects[0].span.line, 4);
        assert!(a.call_graph.topological_order().is_none());
    }

    #[test]
    fn isolated_sites_need_a_flow_to_stand_out() {
        let a = run("{{rows}} = CALL fetch()\n{{n}} = CALL count({{rows}})\nCALL log(\"done\")");
        assert_eq!(a.call_graph.isolated_sites(), vec![2]);

        let a = run("CALL f()\nCALL g()");
        assert!(a.call_graph.isolated_sites().is_empty());
    }

    #[test]
    fn site_ids_match_own_calls() {
        let (stmts, _) = parse("IF CALL a(CALL b()) AND CALL c()\n  CALL d()\nELIF CALL e()\nENDIF");
        let a = analyze(&stmts, &[]);
        for (span, ordinal, call) in stmts[0].own_calls() {
            let id = a.call_graph.site_id(span, ordinal).unwrap();
            assert_eq!(a.call_graph.sites()[id].function, call.function_name);
        }
    }
}
