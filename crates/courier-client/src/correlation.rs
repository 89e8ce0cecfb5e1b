// Outstanding-request tracking shared by a publisher and its subscriber.
use courier_wire::CorrelationId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a response was tied to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribution {
    /// The response echoed the token of an outstanding request.
    Matched(CorrelationId),
    /// The response carried no token and was assigned to the most recently
    /// sent outstanding request. With overlapping requests this pairing is
    /// not guaranteed to be the true one.
    Assumed(CorrelationId),
    /// No request tracking is attached to the subscriber.
    Unattributed,
}

impl Attribution {
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Attribution::Matched(id) | Attribution::Assumed(id) => Some(*id),
            Attribution::Unattributed => None,
        }
    }
}

/// Upper bound on outstanding requests tracked by one [`Correlator`].
pub const DEFAULT_MAX_OUTSTANDING: usize = 4096;

/// Pending-request table keyed by correlation token.
///
/// Entries expire after `ttl`; a response that arrives later is treated as
/// unsolicited. At most `max_outstanding` requests are held; registering
/// past that evicts the oldest.
///
/// ```
/// use courier_client::{Attribution, Correlator};
/// use courier_wire::CorrelationId;
/// use std::time::Duration;
///
/// let correlator = Correlator::new(Duration::from_secs(60));
/// let id = CorrelationId::new();
/// correlator.register(id);
/// assert_eq!(correlator.resolve(Some(id)), Some(Attribution::Matched(id)));
/// assert_eq!(correlator.resolve(Some(id)), None);
/// ```
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Mutex<PendingTable>>,
    ttl: Duration,
    max_outstanding: usize,
}

#[derive(Default)]
struct PendingTable {
    requests: HashMap<CorrelationId, PendingRequest>,
    next_sequence: u64,
}

struct PendingRequest {
    issued_at: Instant,
    sequence: u64,
}

impl Correlator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PendingTable::default())),
            ttl,
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
        }
    }

    pub fn with_max_outstanding(mut self, max_outstanding: usize) -> Self {
        self.max_outstanding = max_outstanding.max(1);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn register(&self, id: CorrelationId) {
        let mut table = self.inner.lock();
        table.expire(self.ttl);
        while table.requests.len() >= self.max_outstanding {
            let Some(oldest) = table.oldest() else {
                break;
            };
            table.requests.remove(&oldest);
            metrics::counter!("courier_requests_evicted_total").increment(1);
            tracing::warn!(correlation_id = %oldest, "pending request table full; evicted oldest");
        }
        let sequence = table.next_sequence;
        table.next_sequence += 1;
        table.requests.insert(
            id,
            PendingRequest {
                issued_at: Instant::now(),
                sequence,
            },
        );
    }

    // Forget a request whose publish definitely failed.
    pub fn withdraw(&self, id: CorrelationId) -> bool {
        self.inner.lock().requests.remove(&id).is_some()
    }

    pub fn outstanding(&self) -> usize {
        let mut table = self.inner.lock();
        table.expire(self.ttl);
        table.requests.len()
    }

    /// Consume the pending entry a response belongs to. `None` means the
    /// response matches no live request.
    pub fn resolve(&self, token: Option<CorrelationId>) -> Option<Attribution> {
        let mut table = self.inner.lock();
        table.expire(self.ttl);
        match token {
            Some(id) => table
                .requests
                .remove(&id)
                .map(|_| Attribution::Matched(id)),
            None => {
                let latest = table
                    .requests
                    .iter()
                    .max_by_key(|(_, request)| request.sequence)
                    .map(|(id, _)| *id)?;
                table.requests.remove(&latest);
                Some(Attribution::Assumed(latest))
            }
        }
    }
}

impl PendingTable {
    fn oldest(&self) -> Option<CorrelationId> {
        self.requests
            .iter()
            .min_by_key(|(_, request)| request.sequence)
            .map(|(id, _)| *id)
    }

    fn expire(&mut self, ttl: Duration) {
        let now = Instant::now();
        let before = self.requests.len();
        self.requests
            .retain(|_, request| now.duration_since(request.issued_at) < ttl);
        let expired = before - self.requests.len();
        if expired > 0 {
            metrics::counter!("courier_requests_expired_total").increment(expired as u64);
            tracing::debug!(expired, "expired pending requests");
        }
    }
}
