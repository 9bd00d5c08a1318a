//! Concurrent walk of a content graph.

use std::collections::HashSet;
use std::sync::Arc;

use ociclient::{Descriptor, OciDigest};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::handlers::Handler;

/// Walk the graph below `roots`, running `handler` once per distinct digest.
///
/// Every descriptor of a level runs as its own task; the children they
/// report form the next level, in the order of the level that produced
/// them. The first error ends the walk. Tasks still running at that point
/// are detached: they finish on their own and their results are dropped.
pub async fn dispatch(
    cancel: &CancellationToken,
    handler: Arc<dyn Handler>,
    roots: Vec<Descriptor>,
) -> Result<()> {
    let mut seen: HashSet<OciDigest> = HashSet::new();
    let mut frontier = roots;
    let mut depth = 0usize;

    while !frontier.is_empty() {
        let mut tasks = JoinSet::new();
        let mut slots = 0usize;

        for desc in frontier {
            if !seen.insert(desc.digest.clone()) {
                trace!(digest = %desc.digest, "Already dispatched");
                continue;
            }

            let handler = handler.clone();
            let cancel = cancel.clone();
            let slot = slots;
            slots += 1;

            tasks.spawn(async move {
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    outcome = handler.handle(&desc) => outcome,
                };
                (slot, outcome)
            });
        }

        debug!(depth, descriptors = slots, "Dispatching level");

        let mut children: Vec<Vec<Descriptor>> = vec![Vec::new(); slots];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, Ok(handled))) => children[slot] = handled.into_children(),
                Ok((_, Err(err))) => {
                    tasks.detach_all();
                    return Err(err);
                }
                Err(join_err) => {
                    tasks.detach_all();
                    return Err(Error::Internal(format!("handler task failed: {}", join_err)));
                }
            }
        }

        frontier = children.into_iter().flatten().collect();
        depth += 1;
    }

    Ok(())
}
