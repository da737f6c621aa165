//! Attribute inference worker - runs inference off the engine loop
//!
//! The engine submits `(global_id, crop)` requests through `AttributeClient`
//! without blocking: requests are throttled per identity and dropped when the
//! bounded queue is full. The worker writes each result, stamped with the time
//! it was produced, into a shared cache that the engine reads on later frames.

use crate::domain::types::{AttributeObservation, Attributes, GlobalId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use image::RgbImage;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Estimates demographic attributes from an appearance crop
#[async_trait]
pub trait AttributeInference: Send + Sync {
    async fn analyze(&self, crop: &RgbImage) -> anyhow::Result<Attributes>;
}

/// An inference request queued for the worker
#[derive(Debug)]
pub struct AttributeRequest {
    pub global_id: GlobalId,
    pub crop: RgbImage,
    /// When the request was enqueued (for queue delay measurement)
    pub enqueued_at: Instant,
}

type ObservationCache = Arc<RwLock<FxHashMap<GlobalId, AttributeObservation>>>;

/// Engine-side handle: throttled submission and cached reads
pub struct AttributeClient {
    tx: mpsc::Sender<AttributeRequest>,
    cache: ObservationCache,
    last_submitted: FxHashMap<GlobalId, DateTime<Utc>>,
    resubmit_interval: Duration,
    metrics: Arc<Metrics>,
}

impl AttributeClient {
    /// Submit a crop for analysis unless the identity was submitted within
    /// the resubmit interval. Never blocks; returns whether it was queued.
    pub fn request(&mut self, global_id: GlobalId, crop: &RgbImage, now: DateTime<Utc>) -> bool {
        if let Some(&last) = self.last_submitted.get(&global_id) {
            if now - last < self.resubmit_interval {
                self.metrics.record_attribute_throttled();
                return false;
            }
        }
        self.last_submitted.insert(global_id, now);

        let request = AttributeRequest { global_id, crop: crop.clone(), enqueued_at: Instant::now() };
        match self.tx.try_send(request) {
            Ok(()) => {
                self.metrics.record_attribute_submitted();
                true
            }
            Err(TrySendError::Full(_)) => {
                // Freshness over completeness: the next detection resubmits
                self.metrics.record_attribute_dropped();
                debug!(global_id = %global_id, "attribute_request_dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(global_id = %global_id, "attribute_worker_closed");
                false
            }
        }
    }

    /// Last observation for an identity, if any
    pub fn latest(&self, global_id: GlobalId) -> Option<AttributeObservation> {
        self.cache.read().get(&global_id).cloned()
    }

    /// Forget identities for which `keep` returns false
    pub fn retain(&mut self, keep: impl Fn(GlobalId) -> bool) {
        self.last_submitted.retain(|gid, _| keep(*gid));
        self.cache.write().retain(|gid, _| keep(*gid));
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }
}

/// Worker that runs inference requests one at a time
pub struct AttributeWorker {
    inference: Arc<dyn AttributeInference>,
    rx: mpsc::Receiver<AttributeRequest>,
    cache: ObservationCache,
    metrics: Arc<Metrics>,
}

impl AttributeWorker {
    /// Run the worker, processing requests until the channel closes
    pub async fn run(mut self) {
        info!("attribute_worker_started");

        while let Some(request) = self.rx.recv().await {
            self.process(request).await;
        }

        info!("attribute_worker_stopped");
    }

    async fn process(&self, request: AttributeRequest) {
        let queue_delay_us = request.enqueued_at.elapsed().as_micros() as u64;
        let attributes = match self.inference.analyze(&request.crop).await {
            Ok(attributes) => {
                debug!(
                    global_id = %request.global_id,
                    gender = %attributes.gender,
                    age = %attributes.age_label(),
                    emotion = ?attributes.emotion,
                    queue_delay_us = %queue_delay_us,
                    "attributes_inferred"
                );
                attributes
            }
            Err(e) => {
                // Stored with a fresh timestamp so throttling still applies
                self.metrics.record_inference_failure();
                warn!(global_id = %request.global_id, error = %e, "attribute_inference_failed");
                Attributes::unknown()
            }
        };

        let observation = AttributeObservation { attributes, observed_at: Utc::now() };
        self.cache.write().insert(request.global_id, observation);
    }
}

/// Create an attribute request channel and worker
///
/// Returns the client (for the engine) and the worker (to be spawned)
pub fn create_attribute_worker(
    inference: Arc<dyn AttributeInference>,
    metrics: Arc<Metrics>,
    queue_capacity: usize,
    resubmit_interval: Duration,
) -> (AttributeClient, AttributeWorker) {
    let (tx, rx) = mpsc::channel(queue_capacity.max(1));
    let cache: ObservationCache = Arc::new(RwLock::new(FxHashMap::default()));
    let client = AttributeClient {
        tx,
        cache: cache.clone(),
        last_submitted: FxHashMap::default(),
        resubmit_interval,
        metrics: metrics.clone(),
    };
    let worker = AttributeWorker { inference, rx, cache, metrics };
    (client, worker)
}

/// `create_attribute_worker` with the configured queue size and throttle
pub fn attribute_worker_from_config(
    config: &Config,
    inference: Arc<dyn AttributeInference>,
    metrics: Arc<Metrics>,
) -> (AttributeClient, AttributeWorker) {
    create_attribute_worker(
        inference,
        metrics,
        config.attributes_queue_capacity(),
        Duration::milliseconds(config.attributes_resubmit_interval_ms() as i64),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Gender;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedInference {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AttributeInference for FixedInference {
        async fn analyze(&self, _crop: &RgbImage) -> anyhow::Result<Attributes> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                anyhow::bail!("service unavailable");
            }
            Ok(Attributes { gender: Gender::Woman, age: Some(31), emotion: Some("happy".into()) })
        }
    }

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn setup(fail: bool, capacity: usize) -> (AttributeClient, AttributeWorker, Arc<FixedInference>, Arc<Metrics>) {
        let inference = Arc::new(FixedInference { calls: AtomicUsize::new(0), fail });
        let metrics = Arc::new(Metrics::new());
        let (client, worker) =
            create_attribute_worker(inference.clone(), metrics.clone(), capacity, Duration::seconds(1));
        (client, worker, inference, metrics)
    }

    fn crop() -> RgbImage {
        RgbImage::new(4, 4)
    }

    #[test]
    fn test_resubmission_is_throttled() {
        let (mut client, _worker, _, metrics) = setup(false, 5);
        assert!(client.request(GlobalId(1), &crop(), t(0)));
        assert!(!client.request(GlobalId(1), &crop(), t(500)));
        assert!(!client.request(GlobalId(1), &crop(), t(999)));
        assert!(client.request(GlobalId(1), &crop(), t(1000)));
        // Other identities are independent
        assert!(client.request(GlobalId(2), &crop(), t(999)));
        assert_eq!(metrics.attribute_requests_throttled(), 2);
    }

    #[test]
    fn test_full_queue_drops_new_request() {
        let (mut client, _worker, _, metrics) = setup(false, 5);
        for gid in 0..5 {
            assert!(client.request(GlobalId(gid), &crop(), t(0)));
        }
        assert!(!client.request(GlobalId(5), &crop(), t(0)));
        assert_eq!(metrics.attribute_requests_dropped(), 1);
    }

    #[tokio::test]
    async fn test_worker_caches_results() {
        let (mut client, worker, inference, _) = setup(false, 5);
        client.request(GlobalId(1), &crop(), t(0));
        client.request(GlobalId(2), &crop(), t(0));
        assert!(client.latest(GlobalId(1)).is_none());

        let handle = tokio::spawn(worker.run());
        for _ in 0..100 {
            if client.cached_len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        handle.abort();

        let observation = client.latest(GlobalId(1)).unwrap();
        assert_eq!(observation.attributes.gender, Gender::Woman);
        assert_eq!(observation.attributes.age, Some(31));
        assert_eq!(inference.calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_failure_caches_unknown() {
        let (mut client, worker, _, metrics) = setup(true, 5);
        client.request(GlobalId(9), &crop(), t(0));
        // Closing the client ends the worker once the queue is empty
        drop(client);
        worker.run().await;

        assert_eq!(metrics.inference_failures(), 1);
    }

    #[tokio::test]
    async fn test_failure_observation_is_unknown() {
        let (mut client, mut worker, _, _) = setup(true, 5);
        client.request(GlobalId(9), &crop(), t(0));
        let request = worker.rx.recv().await.unwrap();
        worker.process(request).await;

        let observation = client.latest(GlobalId(9)).unwrap();
        assert_eq!(observation.attributes, Attributes::unknown());
    }

    #[test]
    fn test_retain_forgets_identities() {
        let (mut client, _worker, _, _) = setup(false, 5);
        client.request(GlobalId(1), &crop(), t(0));
        client.cache.write().insert(
            GlobalId(1),
            AttributeObservation { attributes: Attributes::unknown(), observed_at: t(0) },
        );

        client.retain(|gid| gid != GlobalId(1));
        assert!(client.latest(GlobalId(1)).is_none());
        // Throttle state is gone too
        assert!(client.request(GlobalId(1), &crop(), t(10)));
    }
}
