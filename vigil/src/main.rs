#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::io::Read;

use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;
use serde::Serialize;

use vigil_exec::{
    build_initial_state, Evaluator, ExecConfig, GraphOracle, NoOracle, Services, StdLibrary,
    TemplateCache,
};
use vigil_expr::{NodeKind, StmtKind};

#[derive(Parser, Debug)]
#[command(name = "vigil", version, about = "Abstract-execution queries over C-family snippets")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Evaluate an expression at the end of a snippet
    Eval {
        /// Expression to evaluate, e.g. "x + 3"
        expr: String,

        /// Path to the snippet; if omitted, reads from stdin
        #[arg(long)]
        file: Option<std::path::PathBuf>,

        /// Print machine-readable JSON
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Expression recursion budget
        #[arg(long, default_value_t = 10)]
        depth: u32,

        /// Function inlining budget
        #[arg(long, default_value_t = 4)]
        inline_depth: u32,
    },

    /// Report every derived fact at the end of a snippet
    Facts {
        /// Path to the snippet; if omitted, reads from stdin
        #[arg(long)]
        file: Option<std::path::PathBuf>,

        /// Print machine-readable JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
struct EvalOut {
    expr: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct FactsOut {
    facts: BTreeMap<String, String>,
}

fn read_source(file: Option<std::path::PathBuf>) -> miette::Result<String> {
    match file {
        Some(p) => std::fs::read_to_string(p).into_diagnostic(),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).into_diagnostic()?;
            Ok(buf)
        }
    }
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let oracle = GraphOracle;
    let library = StdLibrary;
    let bounds = NoOracle;
    let templates = TemplateCache::new();
    let services = Services::new(&oracle, &library, &bounds, &templates);

    match cli.cmd {
        Cmd::Eval {
            expr,
            file,
            json,
            depth,
            inline_depth,
        } => {
            let src = read_source(file)?;
            // The query rides along as the final statement of the unit, so
            // its names resolve against the snippet's own identities.
            let combined = format!("{src}\n{expr};\n");
            let tree = vigil_parse::parse_unit(&combined)?;

            let Some(query_point) = (0..tree.stmts.len())
                .rev()
                .map(|i| vigil_expr::Point(i as u32))
                .find(|p| matches!(tree.stmt(*p).map(|s| &s.kind), Some(StmtKind::Expr(_))))
            else {
                return Err(miette::miette!("no expression to evaluate"));
            };
            let Some(StmtKind::Expr(root)) = tree.stmt(query_point).map(|s| s.kind.clone()) else {
                return Err(miette::miette!("no expression to evaluate"));
            };

            let config = ExecConfig {
                max_expr_depth: depth,
                max_inline_depth: inline_depth,
                ..Default::default()
            };
            let mut state = build_initial_state(
                &tree,
                &services,
                &config,
                query_point,
                None,
                &vigil_exec::ProgramState::new(),
            );
            let evaluator = Evaluator::new(&tree, &services, &config);
            let value = evaluator.evaluate(&mut state, root);

            if json {
                let out = EvalOut {
                    expr,
                    value: value.display(),
                };
                println!("{}", serde_json::to_string(&out).into_diagnostic()?);
            } else {
                println!("{}", value.display());
            }
            Ok(())
        }

        Cmd::Facts { file, json } => {
            let src = read_source(file)?;
            let tree = vigil_parse::parse_unit(&src)?;
            let config = ExecConfig::default();
            let state = build_initial_state(
                &tree,
                &services,
                &config,
                tree.end_point(),
                None,
                &vigil_exec::ProgramState::new(),
            );

            // Map identities back to the names that carry them.
            let mut names: BTreeMap<u64, String> = BTreeMap::new();
            for node in &tree.nodes {
                if let NodeKind::Name(name) = &node.kind {
                    names.entry(node.identity.0).or_insert_with(|| name.clone());
                }
            }
            let mut facts: BTreeMap<String, String> = BTreeMap::new();
            for (ident, entry) in state.entries() {
                let label = names
                    .get(&ident.0)
                    .cloned()
                    .unwrap_or_else(|| format!("expr#{}", ident.0));
                facts.insert(label, entry.value.display());
            }

            if json {
                println!(
                    "{}",
                    serde_json::to_string(&FactsOut { facts }).into_diagnostic()?
                );
            } else {
                for (name, value) in facts {
                    println!("{name} = {value}");
                }
            }
            Ok(())
        }
    }
}
