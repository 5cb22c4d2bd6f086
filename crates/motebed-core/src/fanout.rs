//! Parallel per-node operations.
//!
//! Each node gets its own scoped thread; the calling thread joins them all
//! before looking at any result. A node's outcome combines the operation's
//! return value with the node's own success flag, and a panicking operation
//! only fails the node it ran on.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;

use crate::error::{MotebedError, Result};
use crate::node::Node;

/// Outcome of one node in a fan-out round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeOutcome {
    pub node: u32,
    pub success: bool,
    /// Error text for failed nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Every node's outcome of one fan-out round, in node order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FanOutReport {
    pub operation: String,
    pub outcomes: Vec<NodeOutcome>,
    pub elapsed_ms: u64,
}

impl FanOutReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.success)
    }

    /// Ids of the nodes that failed.
    pub fn failed(&self) -> Vec<u32> {
        self.outcomes
            .iter()
            .filter(|o| !o.success)
            .map(|o| o.node)
            .collect()
    }

    pub fn outcome(&self, node: u32) -> Option<&NodeOutcome> {
        self.outcomes.iter().find(|o| o.node == node)
    }

    /// `Ok(self)` if every node succeeded, otherwise the aggregate failure
    /// for `operation`. Install rounds get their own error variant.
    pub fn into_result(self, operation: &'static str) -> Result<Self> {
        if self.all_succeeded() {
            return Ok(self);
        }
        let failed = self.failed();
        Err(if operation == "install" {
            MotebedError::Install {
                failed,
                report: self,
            }
        } else {
            MotebedError::FanOut {
                operation,
                failed,
                report: self,
            }
        })
    }
}

/// Runs one operation on every node concurrently.
#[derive(Debug, Clone, Copy, Default)]
pub struct FanOutController;

impl FanOutController {
    pub fn new() -> Self {
        Self
    }

    /// Run `op` on every node, one thread per node, and wait for all of
    /// them. A node succeeds if `op` returned `Ok` and `succeeded` then holds
    /// for it. No node is retried and no node's failure stops another.
    pub fn run_all<F, S>(
        &self,
        operation: &str,
        nodes: &mut [Box<dyn Node>],
        op: F,
        succeeded: S,
    ) -> FanOutReport
    where
        F: Fn(&mut dyn Node) -> Result<()> + Sync,
        S: Fn(&dyn Node) -> bool,
    {
        let t0 = Instant::now();
        let op = &op;

        let results: Vec<std::result::Result<(), String>> = std::thread::scope(|s| {
            let handles: Vec<_> = nodes
                .iter_mut()
                .map(|node| {
                    s.spawn(move || {
                        match catch_unwind(AssertUnwindSafe(|| op(node.as_mut()))) {
                            Ok(Ok(())) => Ok(()),
                            Ok(Err(e)) => Err(e.to_string()),
                            Err(_) => Err("operation panicked".to_string()),
                        }
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|_| Err("worker panicked".to_string())))
                .collect()
        });

        let outcomes = nodes
            .iter()
            .zip(results)
            .map(|(node, result)| {
                let outcome = match result {
                    Ok(()) if succeeded(node.as_ref()) => NodeOutcome {
                        node: node.id(),
                        success: true,
                        detail: None,
                    },
                    Ok(()) => NodeOutcome {
                        node: node.id(),
                        success: false,
                        detail: Some(format!("{operation} reported failure")),
                    },
                    Err(detail) => NodeOutcome {
                        node: node.id(),
                        success: false,
                        detail: Some(detail),
                    },
                };
                if let Some(detail) = &outcome.detail {
                    log::warn!("node {}: {operation} failed: {detail}", outcome.node);
                }
                outcome
            })
            .collect();

        let report = FanOutReport {
            operation: operation.to_string(),
            outcomes,
            elapsed_ms: t0.elapsed().as_millis() as u64,
        };
        log::info!(
            "{operation}: {}/{} nodes succeeded in {} ms",
            report.outcomes.len() - report.failed().len(),
            report.outcomes.len(),
            report.elapsed_ms
        );
        report
    }

    /// Run `op` on one node after another, sleeping a random delay in
    /// `[0, max_delay)` before each node after the first. Used to spread
    /// out node start-up so that nodes do not run in lockstep.
    pub fn run_staggered<F>(
        &self,
        operation: &str,
        nodes: &mut [Box<dyn Node>],
        max_delay: Duration,
        op: F,
    ) -> FanOutReport
    where
        F: Fn(&mut dyn Node) -> Result<()>,
    {
        let t0 = Instant::now();
        let mut rng = rand::rng();
        let mut outcomes = Vec::with_capacity(nodes.len());

        for (i, node) in nodes.iter_mut().enumerate() {
            if i > 0 && !max_delay.is_zero() {
                let delay = rng.random_range(Duration::ZERO..max_delay);
                log::debug!("{operation}: waiting {delay:?} before node {}", node.id());
                std::thread::sleep(delay);
            }
            let result = op(node.as_mut());
            if let Err(e) = &result {
                log::warn!("node {}: {operation} failed: {e}", node.id());
            }
            outcomes.push(NodeOutcome {
                node: node.id(),
                success: result.is_ok(),
                detail: result.err().map(|e| e.to_string()),
            });
        }

        FanOutReport {
            operation: operation.to_string(),
            outcomes,
            elapsed_ms: t0.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, TestbedConfig};
    use crate::node::{NodeFamily, NodeState};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory node whose install outcome is fixed up front.
    struct MockNode {
        state: NodeState,
        install_ok: bool,
        panics: bool,
    }

    impl MockNode {
        fn boxed(id: u32, install_ok: bool) -> Box<dyn Node> {
            Box::new(Self {
                state: NodeState::new(id, format!("node{id}")),
                install_ok,
                panics: false,
            })
        }
    }

    impl Node for MockNode {
        fn configure(config: &NodeConfig, _: &TestbedConfig) -> Result<Self> {
            let id = config.id()?;
            Ok(Self {
                state: NodeState::new(id, format!("node{id}")),
                install_ok: true,
                panics: false,
            })
        }

        fn family(&self) -> NodeFamily {
            NodeFamily::Telos
        }

        fn state(&self) -> &NodeState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut NodeState {
            &mut self.state
        }

        fn install(&mut self) -> Result<()> {
            if self.panics {
                panic!("flasher crashed");
            }
            let ok = self.install_ok;
            self.state.set_install_success(ok);
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn install(nodes: &mut [Box<dyn Node>]) -> FanOutReport {
        FanOutController::new().run_all(
            "install",
            nodes,
            |n| n.install(),
            |n| n.is_install_success(),
        )
    }

    // -----------------------------------------------------------------------
    // Aggregation
    // -----------------------------------------------------------------------

    #[test]
    fn test_all_succeed() {
        let mut nodes: Vec<_> = (1..=4).map(|id| MockNode::boxed(id, true)).collect();
        let report = install(&mut nodes);
        assert!(report.all_succeeded());
        assert_eq!(report.outcomes.len(), 4);
        assert!(report.into_result("install").is_ok());
    }

    #[test]
    fn test_one_failure_isolated() {
        let mut nodes: Vec<_> = (1..=5).map(|id| MockNode::boxed(id, id != 3)).collect();
        let report = install(&mut nodes);

        assert_eq!(report.failed(), vec![3]);
        for id in [1, 2, 4, 5] {
            assert!(report.outcome(id).unwrap().success);
        }
        match report.into_result("install") {
            Err(MotebedError::Install { failed, report }) => {
                assert_eq!(failed, vec![3]);
                assert_eq!(report.outcomes.len(), 5);
            }
            other => panic!("expected install error, got {other:?}"),
        }
    }

    #[test]
    fn test_success_flag_beats_return_value() {
        // install returns Ok but the node's own flag says it failed
        let mut nodes = vec![MockNode::boxed(1, false)];
        let report = install(&mut nodes);
        assert!(!report.all_succeeded());
        assert!(report.outcomes[0].detail.is_some());
    }

    #[test]
    fn test_panic_fails_only_that_node() {
        let mut nodes = vec![
            MockNode::boxed(1, true),
            Box::new(MockNode {
                state: NodeState::new(2, "node2"),
                install_ok: true,
                panics: true,
            }) as Box<dyn Node>,
        ];
        let report = install(&mut nodes);
        assert!(report.outcome(1).unwrap().success);
        assert!(!report.outcome(2).unwrap().success);
    }

    #[test]
    fn test_unsupported_capability_reported() {
        let mut nodes: Vec<_> = (1..=2).map(|id| MockNode::boxed(id, true)).collect();
        let report = FanOutController::new().run_all("stop", &mut nodes, |n| n.stop(), |_| true);
        assert_eq!(report.failed(), vec![1, 2]);
        assert!(matches!(
            report.into_result("stop"),
            Err(MotebedError::FanOut { operation: "stop", .. })
        ));
    }

    #[test]
    fn test_runs_concurrently() {
        let mut nodes: Vec<_> = (1..=4).map(|id| MockNode::boxed(id, true)).collect();
        let t0 = Instant::now();
        let report = FanOutController::new().run_all(
            "sleep",
            &mut nodes,
            |_| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            },
            |_| true,
        );
        assert!(report.all_succeeded());
        assert!(t0.elapsed() < Duration::from_millis(700));
    }

    // -----------------------------------------------------------------------
    // Staggered
    // -----------------------------------------------------------------------

    #[test]
    fn test_staggered_visits_in_order() {
        let mut nodes: Vec<_> = (1..=3).map(|id| MockNode::boxed(id, true)).collect();
        let visited = AtomicUsize::new(0);
        let report = FanOutController::new().run_staggered(
            "reset",
            &mut nodes,
            Duration::from_millis(5),
            |n| {
                let seen = visited.fetch_add(1, Ordering::SeqCst);
                assert_eq!(seen as u32 + 1, n.id());
                n.reset()
            },
        );
        assert!(report.all_succeeded());
        assert_eq!(visited.load(Ordering::SeqCst), 3);
    }
}
