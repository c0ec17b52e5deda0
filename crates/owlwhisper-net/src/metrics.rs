use libp2p::PeerId;

/// Pluggable metrics hook. The default is a no-op so metrics stay an
/// optional ambient concern rather than a hard dependency for embedders.
pub trait MetricsSink: Send + Sync {
    fn peer_connected(&self, _peer_id: PeerId) {}
    fn peer_disconnected(&self, _peer_id: PeerId) {}
    fn message_sent(&self, _bytes: usize) {}
    fn message_received(&self, _bytes: usize) {}
    fn event_dropped(&self) {}
}

#[derive(Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {}
