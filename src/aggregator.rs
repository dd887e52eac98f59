use actix::prelude::*;
use log::debug;

use crate::{cluster::ActorHost, error::Result, metrics::MetricsMapping};

/* -------------------------------------------------------------------------- */
/*                                  Messages                                  */
/* -------------------------------------------------------------------------- */

/// partition task -> aggregator
#[derive(Message)]
#[rtype(result = "()")]
pub struct AddMetrics(pub MetricsMapping);

/// coordinator -> aggregator
#[derive(Message)]
#[rtype(result = "Result<MetricsMapping>")]
pub struct Collect;

/// coordinator -> aggregator
#[derive(Message)]
#[rtype(result = "()")]
pub struct Stop;

/* -------------------------------------------------------------------------- */
/*                                    Actor                                   */
/* -------------------------------------------------------------------------- */

/// Accumulates the metrics pushed by concurrent partition tasks.
///
/// Being an actor, it handles one message at a time, so concurrent `AddMetrics` need no
/// locking. Summation is commutative, the arrival order doesn't change the merged result.
#[derive(Default)]
pub struct MetricAggregator {
    received: Vec<MetricsMapping>,
}

impl Actor for MetricAggregator {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        debug!("metric aggregator started");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        debug!(
            received = self.received.len();
            "metric aggregator stopped"
        );
    }
}

impl Handler<AddMetrics> for MetricAggregator {
    type Result = ();

    fn handle(&mut self, msg: AddMetrics, _ctx: &mut Self::Context) {
        self.received.push(msg.0);
    }
}

impl Handler<Collect> for MetricAggregator {
    type Result = Result<MetricsMapping>;

    fn handle(&mut self, _msg: Collect, _ctx: &mut Self::Context) -> Self::Result {
        MetricsMapping::sum(&self.received)
    }
}

impl Handler<Stop> for MetricAggregator {
    type Result = ();

    fn handle(&mut self, _msg: Stop, ctx: &mut Self::Context) {
        ctx.stop();
    }
}

/* -------------------------------------------------------------------------- */
/*                                   Handle                                   */
/* -------------------------------------------------------------------------- */

/// Cheap to clone address of a `MetricAggregator`, usable from any thread.
#[derive(Clone)]
pub struct AggregatorHandle {
    addr: Addr<MetricAggregator>,
}

impl AggregatorHandle {
    /// Starts a fresh aggregator on the given actor host.
    pub fn spawn(host: &ActorHost) -> Self {
        Self {
            addr: host.spawn(|_| MetricAggregator::default()),
        }
    }

    /// Pushes a partition's metrics, resolves once the aggregator stored them.
    pub async fn add(&self, metrics: MetricsMapping) -> Result<()> {
        self.addr.send(AddMetrics(metrics)).await?;
        Ok(())
    }

    /// Merges every mapping received so far.
    ///
    /// It's the caller's job to only collect once every expected `add` resolved.
    pub async fn collect(&self) -> Result<MetricsMapping> {
        self.addr.send(Collect).await?
    }

    /// Asks the aggregator to stop, later calls fail with an `Actor` error.
    pub fn stop(&self) {
        self.addr.do_send(Stop);
    }

    /// Whether the aggregator can still receive messages.
    pub fn is_alive(&self) -> bool {
        self.addr.connected()
    }
}

impl std::fmt::Debug for AggregatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatorHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}
