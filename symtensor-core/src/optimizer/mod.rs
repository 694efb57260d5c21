//! Program-to-program rewrites run by [`Program::compile`](crate::graph::Program::compile).
//!
//! Every pass rebuilds the graph instead of editing it in place, keeping only what the
//! program's outputs and updates still read.

use log::debug;

use crate::{
    capability::CapabilityTable,
    config::CompileConfig,
    context::ExecutionContext,
    graph::Program,
    types::Location,
    Error, Result,
};

mod canonicalize;
mod dce;
mod fusion;
mod inplace;
mod placement;
mod rewrite;
mod transfer;

pub use canonicalize::Canonicalize;
pub use dce::DeadCodeElimination;
pub use fusion::Fusion;
pub use inplace::InPlace;
pub use placement::Placement;
pub use transfer::TransferElimination;

/// Names of the standard passes, in the order they run.
pub const PASS_NAMES: [&str; 6] = [
    "canonicalize",
    "placement",
    "transfer",
    "fusion",
    "inplace",
    "dce",
];

/// What a pass can see besides the program.
pub struct PassContext<'a> {
    ctx: &'a ExecutionContext,
}

impl<'a> PassContext<'a> {
    pub fn new(ctx: &'a ExecutionContext) -> Self {
        Self { ctx }
    }

    pub fn ctx(&self) -> &'a ExecutionContext {
        self.ctx
    }

    pub fn config(&self) -> &'a CompileConfig {
        self.ctx.config()
    }

    pub fn target(&self) -> Location {
        self.ctx.target()
    }

    pub fn capabilities(&self, loc: Location) -> Result<&'a CapabilityTable> {
        self.ctx.capabilities(loc)
    }
}

/// A semantics-preserving `Program -> Program` rewrite.
pub trait Pass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, program: &Program, cx: &PassContext) -> Result<Program>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassStats {
    pub name: &'static str,
    pub nodes_before: usize,
    pub nodes_after: usize,
    pub transfers_before: usize,
    pub transfers_after: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub passes: Vec<PassStats>,
}

impl PipelineReport {
    pub fn get(&self, name: &str) -> Option<&PassStats> {
        self.passes.iter().find(|p| p.name == name)
    }
}

pub struct Pipeline {
    passes: Vec<Box<dyn Pass>>,
}

impl Pipeline {
    pub fn new(passes: Vec<Box<dyn Pass>>) -> Self {
        Self { passes }
    }

    /// The standard passes minus `config.excluded_passes`.
    pub fn standard(config: &CompileConfig) -> Result<Self> {
        for name in &config.excluded_passes {
            if name == "placement" {
                return Err(Error::Configuration(
                    "the placement pass cannot be excluded".to_string(),
                ));
            }
            if !PASS_NAMES.contains(&name.as_str()) {
                return Err(Error::Configuration(format!("unknown pass `{name}`")));
            }
        }
        let all: Vec<Box<dyn Pass>> = vec![
            Box::new(Canonicalize),
            Box::new(Placement),
            Box::new(TransferElimination),
            Box::new(Fusion),
            Box::new(InPlace),
            Box::new(DeadCodeElimination),
        ];
        Ok(Self::new(
            all.into_iter()
                .filter(|p| !config.excluded_passes.iter().any(|e| e == p.name()))
                .collect(),
        ))
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn run(&self, program: Program, cx: &PassContext) -> Result<(Program, PipelineReport)> {
        let mut program = program;
        let mut report = PipelineReport::default();
        for pass in &self.passes {
            let (nodes_before, transfers_before) = (program.node_count(), program.transfer_count());
            program = pass.run(&program, cx)?;
            let stats = PassStats {
                name: pass.name(),
                nodes_before,
                nodes_after: program.node_count(),
                transfers_before,
                transfers_after: program.transfer_count(),
            };
            debug!(
                "pass {}: {} -> {} nodes, {} -> {} transfers",
                stats.name,
                stats.nodes_before,
                stats.nodes_after,
                stats.transfers_before,
                stats.transfers_after
            );
            report.passes.push(stats);
        }
        Ok((program, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusions() {
        let config = CompileConfig::default().exclude_pass("fusion");
        let p = Pipeline::standard(&config).unwrap();
        assert_eq!(
            p.pass_names(),
            vec!["canonicalize", "placement", "transfer", "inplace", "dce"]
        );
        let config = CompileConfig::default().exclude_pass("placement");
        assert!(matches!(
            Pipeline::standard(&config).err(),
            Some(Error::Configuration(_))
        ));
        let config = CompileConfig::default().exclude_pass("vectorize");
        assert!(Pipeline::standard(&config).is_err());
    }
}
