use std::collections::HashMap;

use log::{debug, warn};

use super::{rewrite::Rewriter, Pass, PassContext};
use crate::{
    config::FallbackPolicy,
    graph::{Node, OpKind, Program, VarId},
    types::{DeviceAffinity, Location},
    Error, Result,
};

/// Assigns every live node to the host or the accelerator and inserts a transfer at
/// every edge crossing between them.
#[derive(Debug, Clone, Copy, Default)]
pub struct Placement;

struct Placer<'a, 'p> {
    rw: Rewriter<'p>,
    cx: &'a PassContext<'a>,
    /// One transfer per `(value, destination)`.
    transfers: HashMap<(VarId, Location), VarId>,
}

impl Placer<'_, '_> {
    fn location(&self, v: VarId) -> Result<Location> {
        Ok(self.rw.location(v)?.unwrap_or(Location::Host))
    }

    /// `v` as seen from `dest`, transferring it if needed.
    fn get_at(&mut self, v: VarId, dest: Location) -> Result<VarId> {
        if self.location(v)? == dest {
            return Ok(v);
        }
        if let Some(t) = self.transfers.get(&(v, dest)) {
            return Ok(*t);
        }
        let op = match dest {
            Location::Host => OpKind::ToHost,
            Location::Device(n) => OpKind::ToDevice(n),
        };
        let t = self.rw.emit(op, vec![v], dest.into(), None)?;
        self.transfers.insert((v, dest), t);
        Ok(t)
    }

    /// Where `node` runs, according to the fallback policy.
    fn choose(&self, node: &Node) -> Result<Location> {
        let graph = self.rw.src().graph();
        let mut elems = node
            .inputs
            .iter()
            .map(|v| graph.ty(*v).map(|t| t.elem))
            .collect::<Result<Vec<_>>>()?;
        elems.push(graph.ty(node.output())?.elem);
        elems.dedup();

        let target = self.cx.target();
        let caps = self.cx.capabilities(target)?;
        let reason = match caps.supports(&node.op, &elems) {
            Ok(()) => return Ok(target),
            Err(reason) => reason,
        };
        let failure = |device: &str, reason: String| Error::Placement {
            node: node.label(),
            op: node.op.to_string(),
            device: device.to_string(),
            reason,
        };
        if target.is_host() {
            return Err(failure(caps.name(), reason));
        }
        match self.cx.config().fallback {
            FallbackPolicy::Strict => return Err(failure(caps.name(), reason)),
            FallbackPolicy::Warn => {
                warn!("{} ({}) falls back to the host: {reason}", node.label(), node.op)
            }
            FallbackPolicy::Silent => {
                debug!("{} ({}) falls back to the host: {reason}", node.label(), node.op)
            }
        }
        let host = self.cx.capabilities(Location::Host)?;
        host.supports(&node.op, &elems)
            .map_err(|reason| failure(host.name(), reason))?;
        Ok(Location::Host)
    }
}

impl Pass for Placement {
    fn name(&self) -> &'static str {
        "placement"
    }

    fn run(&self, program: &Program, cx: &PassContext) -> Result<Program> {
        let live = program.live_nodes();
        let target = cx.target();
        let mut placer = Placer {
            rw: Rewriter::with_leaf_affinity(program, DeviceAffinity::Host)?,
            cx,
            transfers: HashMap::new(),
        };

        for node in program.graph().nodes().iter().filter(|n| live[n.id.0]) {
            let dest = match node.op {
                OpKind::ToHost => Some(Location::Host),
                OpKind::ToDevice(n) if Location::Device(n) == target => Some(target),
                OpKind::ToDevice(n) => {
                    debug!(
                        "{}: accelerator {n} is not targeted, keeping the value on the host",
                        node.label()
                    );
                    Some(Location::Host)
                }
                _ => None,
            };
            // Explicit transfers reuse the transfer of the same value, or vanish when
            // the value is already at the destination.
            if let Some(dest) = dest {
                let src = placer.rw.var(node.inputs[0])?;
                let moved = placer.get_at(src, dest)?;
                placer.rw.alias(node.output(), moved);
                continue;
            }

            let loc = placer.choose(node)?;
            let inputs = node
                .inputs
                .iter()
                .map(|v| {
                    let new = placer.rw.var(*v)?;
                    placer.get_at(new, loc)
                })
                .collect::<Result<Vec<_>>>()?;
            let out = placer
                .rw
                .emit(node.op.clone(), inputs, loc.into(), node.inplace)?;
            placer.rw.alias(node.output(), out);
        }
        placer.rw.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CompileConfig, context::ExecutionContext, dtype::ElemKind, graph::Graph,
    };

    fn place(p: &Program, config: CompileConfig) -> Result<Program> {
        let ctx = ExecutionContext::new(&config)?;
        Placement.run(p, &PassContext::new(&ctx))
    }

    #[test]
    fn inserts_one_transfer_per_value() {
        let mut g = Graph::new();
        let x = g.input(ElemKind::F32, 1);
        let a = g.exp(x).unwrap();
        let b = g.sqrt(x).unwrap();
        let y = g.add(a, b).unwrap();
        let p = Program::new(g, &[x], &[y], &[]).unwrap();
        let out = place(&p, CompileConfig::sim(0)).unwrap();
        assert_eq!(out.transfer_count(), 1);
        assert!(out
            .graph()
            .nodes()
            .iter()
            .all(|n| n.placement == DeviceAffinity::Device(0)));
    }

    #[test]
    fn fallback_policies() {
        let mut g = Graph::new();
        let x = g.input(ElemKind::F64, 1);
        let y = g.exp(x).unwrap();
        let p = Program::new(g, &[x], &[y], &[]).unwrap();

        let err = place(&p, CompileConfig::sim(0)).unwrap_err();
        match err {
            Error::Placement { node, device, .. } => {
                assert_eq!(node, "exp#n0");
                assert_eq!(device, "sim:0");
            }
            other => panic!("unexpected {other}"),
        }
        let out = place(
            &p,
            CompileConfig::sim(0).with_fallback(FallbackPolicy::Silent),
        )
        .unwrap();
        assert_eq!(out.transfer_count(), 0);
        assert_eq!(out.graph().nodes()[0].placement, DeviceAffinity::Host);
    }

    #[test]
    fn explicit_transfers_on_host_vanish() {
        let mut g = Graph::new();
        let x = g.input(ElemKind::F32, 1);
        let d = g.to_device(x, 0).unwrap();
        let h = g.to_host(d).unwrap();
        let y = g.neg(h).unwrap();
        let p = Program::new(g, &[x], &[y], &[]).unwrap();
        let out = place(&p, CompileConfig::host()).unwrap();
        assert_eq!(out.transfer_count(), 0);
        assert_eq!(out.node_count(), 1);
    }
}
