//! Job loop: bus → scan → bus.
//!
//! Every job follows the delayed-ack pattern: decode, scan, publish the
//! result, and only then acknowledge. Any failure before the publish went
//! through is answered with a negative acknowledgement so the bus hands the
//! job out again; reruns are harmless because a scan has no side effects
//! beyond network traffic.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::bus::{BusError, Delivery, MessageBus};
use crate::request::{ScanRequest, ScanRequestHandler};
use crate::scanner::syn_sender::ScanError;

/// Consecutive fetch failures after which the loop gives up.
pub const MAX_FETCH_FAILURES: u32 = 10;

/// Pause after a failed fetch.
const FETCH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Why a job could not be completed.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("undecodable job payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("scan failed: {0}")]
    Scan(#[from] ScanError),

    #[error("unable to encode result: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("unable to publish result: {0}")]
    Publish(#[from] BusError),
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Result published and job acknowledged.
    Completed { open_ports: usize },
    /// Result published, but the acknowledgement failed; the job will be
    /// redelivered and published again.
    Unacknowledged { open_ports: usize },
    /// Job negatively acknowledged; nothing was published.
    Rejected,
}

/// Decode, scan and publish one job. Does not acknowledge.
pub async fn run_job<B>(
    bus: &mut B,
    handler: &ScanRequestHandler,
    delivery: &Delivery,
) -> Result<ScanRequest, JobError>
where
    B: MessageBus + ?Sized,
{
    let mut request: ScanRequest =
        serde_json::from_str(&delivery.payload).map_err(JobError::Decode)?;

    tracing::info!(
        id = %delivery.id,
        target = %request.target_address,
        ports = request.ports.len(),
        redelivered = delivery.redelivered,
        "processing scan"
    );

    process_keeping_claim(bus, handler, delivery, &mut request).await?;
    let body = serde_json::to_string(&request).map_err(JobError::Encode)?;
    bus.publish(&body).await?;
    Ok(request)
}

/// Scan `request`, refreshing the bus's claim on `delivery` while it runs so
/// a long scan is not handed to a second consumer.
async fn process_keeping_claim<B>(
    bus: &mut B,
    handler: &ScanRequestHandler,
    delivery: &Delivery,
    request: &mut ScanRequest,
) -> Result<(), ScanError>
where
    B: MessageBus + ?Sized,
{
    let Some(every) = bus.touch_interval() else {
        return handler.process(request).await;
    };

    let scan = handler.process(request);
    tokio::pin!(scan);
    let mut refresh = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = &mut scan => return result,
            _ = refresh.tick() => {
                if let Err(e) = bus.touch(delivery).await {
                    tracing::warn!(id = %delivery.id, error = %e, "unable to refresh job claim");
                }
            }
        }
    }
}

/// Run one job and settle it on the bus.
pub async fn process_delivery<B>(
    bus: &mut B,
    handler: &ScanRequestHandler,
    delivery: &Delivery,
) -> JobOutcome
where
    B: MessageBus + ?Sized,
{
    let start = Instant::now();
    match run_job(bus, handler, delivery).await {
        Ok(request) => {
            let open_ports = request.ports.len();
            match bus.ack(delivery).await {
                Ok(()) => {
                    tracing::info!(
                        id = %delivery.id,
                        target = %request.target_address,
                        open_ports,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "scan published"
                    );
                    JobOutcome::Completed { open_ports }
                }
                Err(e) => {
                    tracing::warn!(id = %delivery.id, error = %e, "result published but ack failed");
                    JobOutcome::Unacknowledged { open_ports }
                }
            }
        }
        Err(e) => {
            tracing::error!(id = %delivery.id, error = %e, "job failed, requesting redelivery");
            if let Err(nak_err) = bus.nak(delivery).await {
                tracing::warn!(id = %delivery.id, error = %nak_err, "nak failed");
            }
            JobOutcome::Rejected
        }
    }
}

/// Consume jobs one at a time until `shutdown` fires.
///
/// Fetch errors are retried after a short pause; `MAX_FETCH_FAILURES` in a
/// row end the loop with the last error. The bus is closed on every exit.
pub async fn run_worker<B>(
    bus: &mut B,
    handler: &ScanRequestHandler,
    shutdown: CancellationToken,
) -> Result<(), BusError>
where
    B: MessageBus + ?Sized,
{
    if let Err(e) = bus.subscribe().await {
        bus.close().await;
        return Err(e);
    }

    let mut failures = 0u32;
    let result = loop {
        let fetched = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            fetched = bus.fetch() => fetched,
        };

        let deliveries = match fetched {
            Ok(deliveries) => {
                failures = 0;
                deliveries
            }
            Err(e) => {
                failures += 1;
                if failures >= MAX_FETCH_FAILURES {
                    break Err(e);
                }
                tracing::warn!(error = %e, failures, "fetch failed, retrying");
                tokio::time::sleep(FETCH_RETRY_DELAY).await;
                continue;
            }
        };

        for delivery in &deliveries {
            process_delivery(bus, handler, delivery).await;
        }
    };

    bus.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScanCoordinator;
    use crate::scanner::transport::SimulatedTarget;
    use crate::ScanOptions;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    const REMOTE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    /// In-memory bus recording every call.
    #[derive(Default)]
    struct MemoryBus {
        inbox: VecDeque<Delivery>,
        published: Vec<String>,
        acked: Vec<String>,
        nacked: Vec<String>,
        fail_publish: bool,
        fail_fetch: bool,
        touch_every: Option<Duration>,
        touched: Vec<String>,
        subscribed: bool,
        closed: bool,
    }

    #[async_trait]
    impl MessageBus for MemoryBus {
        async fn subscribe(&mut self) -> Result<(), BusError> {
            self.subscribed = true;
            Ok(())
        }

        async fn fetch(&mut self) -> Result<Vec<Delivery>, BusError> {
            if self.fail_fetch {
                return Err(BusError::Command("connection reset".into()));
            }
            match self.inbox.pop_front() {
                Some(d) => Ok(vec![d]),
                None => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(Vec::new())
                }
            }
        }

        async fn publish(&mut self, payload: &str) -> Result<(), BusError> {
            if self.fail_publish {
                return Err(BusError::Command("XADD refused".into()));
            }
            self.published.push(payload.to_string());
            Ok(())
        }

        async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
            self.acked.push(delivery.id.clone());
            Ok(())
        }

        async fn nak(&mut self, delivery: &Delivery) -> Result<(), BusError> {
            self.nacked.push(delivery.id.clone());
            Ok(())
        }

        async fn touch(&mut self, delivery: &Delivery) -> Result<(), BusError> {
            self.touched.push(delivery.id.clone());
            Ok(())
        }

        fn touch_interval(&self) -> Option<Duration> {
            self.touch_every
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    fn handler(target: &SimulatedTarget) -> ScanRequestHandler {
        let defaults = ScanOptions {
            timeout: Duration::from_millis(300),
            ..ScanOptions::default()
        };
        ScanRequestHandler::new(
            ScanCoordinator::new(Arc::new(target.clone())),
            "192.168.1.100",
            defaults,
        )
    }

    fn job(ports: &str) -> String {
        format!(r#"{{"targetAddress":"{REMOTE}","ports":{ports},"requestId":"r-1"}}"#)
    }

    #[tokio::test]
    async fn test_success_publishes_then_acks() {
        let target = SimulatedTarget::new(IpAddr::V4(REMOTE)).with_open_ports([22, 443]);
        let mut bus = MemoryBus::default();
        let delivery = Delivery::new("1-0", job("[21, 22, 443]"));

        let outcome = process_delivery(&mut bus, &handler(&target), &delivery).await;

        assert_eq!(outcome, JobOutcome::Completed { open_ports: 2 });
        assert_eq!(bus.acked, vec!["1-0"]);
        assert!(bus.nacked.is_empty());
        assert_eq!(bus.published.len(), 1);

        let published: serde_json::Value = serde_json::from_str(&bus.published[0]).unwrap();
        assert_eq!(published["ports"], serde_json::json!([22, 443]));
        assert_eq!(published["targetAddress"], REMOTE.to_string());
        assert_eq!(published["requestId"], "r-1", "unknown fields are republished");
    }

    #[tokio::test]
    async fn test_long_scan_keeps_claim_fresh() {
        let target = SimulatedTarget::new(IpAddr::V4(REMOTE)).with_open_ports([22]);
        let mut bus = MemoryBus {
            touch_every: Some(Duration::from_millis(100)),
            ..MemoryBus::default()
        };
        let delivery = Delivery::new("1-1", job("[22]"));

        // Idle window of 300 ms outlasts the refresh period.
        let outcome = process_delivery(&mut bus, &handler(&target), &delivery).await;

        assert_eq!(outcome, JobOutcome::Completed { open_ports: 1 });
        assert!(bus.touched.len() >= 2, "touched {} times", bus.touched.len());
        assert!(bus.touched.iter().all(|id| id == "1-1"));
    }

    #[tokio::test]
    async fn test_oversized_timeout_is_nacked_not_fatal() {
        let target = SimulatedTarget::new(IpAddr::V4(REMOTE)).with_open_ports([80]);
        let mut bus = MemoryBus::default();
        let delivery = Delivery::new(
            "7-0",
            r#"{"targetAddress":"10.0.0.5","ports":[80],"timeoutSeconds":18446744073709551615}"#,
        );

        let outcome = process_delivery(&mut bus, &handler(&target), &delivery).await;

        assert_eq!(outcome, JobOutcome::Rejected);
        assert_eq!(bus.nacked, vec!["7-0"]);
        assert!(bus.published.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_job_is_nacked_without_scanning() {
        let target = SimulatedTarget::new(IpAddr::V4(REMOTE));
        let mut bus = MemoryBus::default();
        let delivery = Delivery::new("2-0", "{not json");

        let outcome = process_delivery(&mut bus, &handler(&target), &delivery).await;

        assert_eq!(outcome, JobOutcome::Rejected);
        assert_eq!(bus.nacked, vec!["2-0"]);
        assert!(bus.published.is_empty());
        assert!(bus.acked.is_empty());
        assert_eq!(target.sent_count(), 0, "no probe sent");
    }

    #[tokio::test]
    async fn test_scan_setup_failure_is_nacked() {
        let target = SimulatedTarget::new(IpAddr::V4(REMOTE)).failing_listen();
        let mut bus = MemoryBus::default();
        let delivery = Delivery::new("3-0", job("[80]"));

        let err = run_job(&mut bus, &handler(&target), &delivery).await.unwrap_err();
        assert!(matches!(err, JobError::Scan(ScanError::Listen(_))));

        let outcome = process_delivery(&mut bus, &handler(&target), &delivery).await;
        assert_eq!(outcome, JobOutcome::Rejected);
        assert_eq!(bus.nacked, vec!["3-0"]);
        assert!(bus.published.is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_nacked() {
        let target = SimulatedTarget::new(IpAddr::V4(REMOTE)).with_open_ports([80]);
        let mut bus = MemoryBus {
            fail_publish: true,
            ..MemoryBus::default()
        };
        let delivery = Delivery::new("4-0", job("[80]"));

        let outcome = process_delivery(&mut bus, &handler(&target), &delivery).await;

        assert_eq!(outcome, JobOutcome::Rejected);
        assert_eq!(bus.nacked, vec!["4-0"]);
        assert!(bus.acked.is_empty());
    }

    #[tokio::test]
    async fn test_redelivered_job_republishes_same_result() {
        let target = SimulatedTarget::new(IpAddr::V4(REMOTE)).with_open_ports([22, 80]);
        let handler = handler(&target);
        let mut bus = MemoryBus::default();
        let first = Delivery::new("5-0", job("[22, 23, 80]"));
        let again = Delivery {
            redelivered: true,
            ..first.clone()
        };

        process_delivery(&mut bus, &handler, &first).await;
        process_delivery(&mut bus, &handler, &again).await;

        assert_eq!(bus.published.len(), 2);
        assert_eq!(bus.published[0], bus.published[1]);
    }

    #[tokio::test]
    async fn test_run_worker_drains_inbox_and_stops_on_shutdown() {
        let target = SimulatedTarget::new(IpAddr::V4(REMOTE)).with_open_ports([80]);
        let handler = handler(&target);
        let mut bus = MemoryBus::default();
        bus.inbox.push_back(Delivery::new("6-0", job("[80]")));
        bus.inbox.push_back(Delivery::new("6-1", "garbage"));

        let shutdown = CancellationToken::new();
        let stopper = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                shutdown.cancel();
            })
        };

        run_worker(&mut bus, &handler, shutdown).await.unwrap();
        stopper.await.unwrap();

        assert!(bus.subscribed);
        assert!(bus.closed);
        assert_eq!(bus.acked, vec!["6-0"]);
        assert_eq!(bus.nacked, vec!["6-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_worker_gives_up_after_repeated_fetch_failures() {
        let target = SimulatedTarget::new(IpAddr::V4(REMOTE));
        let mut bus = MemoryBus {
            fail_fetch: true,
            ..MemoryBus::default()
        };

        let result = run_worker(&mut bus, &handler(&target), CancellationToken::new()).await;

        assert!(matches!(result, Err(BusError::Command(_))));
        assert!(bus.closed);
    }
}
