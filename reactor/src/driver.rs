//! Async driver for a reactor
//!
//! The reactor itself never blocks. The driver sits on a current-thread tokio
//! runtime, sleeps until a delivery, a tick or shutdown arrives, and then runs
//! the reactor until it is idle again.

use manifold_core::{ManifoldResult, ReactorConfig};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::reactor::Reactor;

pub struct ReactorDriver {
    reactor: Reactor,
    idle_poll: Duration,
}

impl ReactorDriver {
    pub fn new(reactor: Reactor, config: &ReactorConfig) -> Self {
        Self {
            reactor,
            idle_poll: Duration::from_millis(config.idle_poll_ms.max(1)),
        }
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Drive the reactor until shutdown. `on_tick` runs on the scheduling
    /// thread every `tick`. Returns the number of tasks run.
    pub async fn run<F>(&self, mut shutdown: watch::Receiver<bool>, tick: Duration, mut on_tick: F) -> ManifoldResult<usize>
    where
        F: FnMut(&Reactor),
    {
        let reactor = &self.reactor;
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut total = 0;

        info!("Driving reactor {}", reactor.node());
        loop {
            total += reactor.run_turn();
            if reactor.is_shut_down() || *shutdown.borrow() {
                break;
            }
            if !reactor.is_idle() {
                // more work than one turn allows; let the runtime breathe
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                delivery = std::future::poll_fn(|cx| reactor.poll_delivery(cx)) => match delivery {
                    Some(delivery) => {
                        if !reactor.accept(delivery) {
                            break;
                        }
                    }
                    None => {
                        reactor.mark_shut_down();
                        break;
                    }
                },
                _ = interval.tick() => on_tick(reactor),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.idle_poll) => {}
            }
        }

        // finish work already accepted
        total += reactor.run_until_idle();
        debug!("Reactor {} stopped after {} tasks", reactor.node(), total);
        Ok(total)
    }
}
