//! Inbound device events: heartbeats, captured SMS and notifications, and
//! delivery reports for outbound SMS.
//!
//! A captured event is logged, matched against the owner's rules, and turned
//! into one delivery job per matching rule.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::delivery::{DeliveryJob, DeliveryQueue, WebhookEvent};
use crate::matcher::RuleMatcher;
use crate::models::{DeviceId, LogDirection, LogId, LogStatus, NewLogEntry, TriggerKind, UserId};
use crate::protocol::{
    DeviceMessage, NotificationReceivedData, SmsFailedData, SmsReceivedData, SmsSentData,
};
use crate::store::Stores;

/// The authenticated device a message arrived from.
#[derive(Debug, Clone, Copy)]
pub struct Origin {
    pub device_id: DeviceId,
    pub user_id: UserId,
}

/// An inbound event, alive only while it is matched and fanned out.
struct InboundEvent {
    trigger: TriggerKind,
    sender: String,
    content: String,
    sim_slot: i32,
    timestamp: DateTime<Utc>,
    app_package: Option<String>,
    title: Option<String>,
}

#[derive(Clone)]
pub struct EventRouter {
    stores: Stores,
    matcher: Arc<RuleMatcher>,
    queue: DeliveryQueue,
}

impl EventRouter {
    pub fn new(stores: Stores, queue: DeliveryQueue) -> Self {
        let matcher = Arc::new(RuleMatcher::new(stores.rules.clone()));
        Self {
            stores,
            matcher,
            queue,
        }
    }

    /// Handle one decoded device message. Returns the number of delivery jobs
    /// enqueued.
    pub async fn handle(&self, origin: Origin, msg: DeviceMessage) -> usize {
        match msg {
            DeviceMessage::Ping(ping) => {
                self.heartbeat(origin.device_id, ping.battery).await;
                0
            }
            DeviceMessage::SmsReceived(sms) => self.sms_received(origin, sms).await,
            DeviceMessage::NotificationReceived(n) => self.notification_received(origin, n).await,
            DeviceMessage::SmsSent(SmsSentData { request_id }) => {
                self.report_outbound(origin, &request_id, LogStatus::Sent, None)
                    .await;
                0
            }
            DeviceMessage::SmsFailed(SmsFailedData { request_id, error }) => {
                let error = if error.is_empty() {
                    "device reported failure".to_string()
                } else {
                    error
                };
                self.report_outbound(origin, &request_id, LogStatus::Failed, Some(error))
                    .await;
                0
            }
            DeviceMessage::Auth(_) => {
                warn!(device_id = %origin.device_id, "Ignoring AUTH on an authenticated session");
                0
            }
            DeviceMessage::Unknown(kind) => {
                warn!(device_id = %origin.device_id, kind, "Unknown message type from device");
                0
            }
        }
    }

    /// Record a device heartbeat: online with its latest battery level.
    pub async fn heartbeat(&self, device_id: DeviceId, battery: i32) {
        if let Err(e) = self.stores.devices.set_online(device_id, battery).await {
            warn!(device_id = %device_id, "Failed to record heartbeat: {e}");
        }
    }

    async fn sms_received(&self, origin: Origin, sms: SmsReceivedData) -> usize {
        info!(device_id = %origin.device_id, sender = %sms.sender, "SMS received");
        self.route(
            origin,
            InboundEvent {
                trigger: TriggerKind::Sms,
                sender: sms.sender,
                content: sms.content,
                sim_slot: sms.sim_slot,
                timestamp: sms.timestamp.unwrap_or_else(Utc::now),
                app_package: None,
                title: None,
            },
        )
        .await
    }

    async fn notification_received(&self, origin: Origin, n: NotificationReceivedData) -> usize {
        info!(device_id = %origin.device_id, package = %n.package_name, "Notification received");
        let content = if n.title.is_empty() {
            n.content
        } else {
            format!("{}\n{}", n.title, n.content)
        };
        self.route(
            origin,
            InboundEvent {
                trigger: TriggerKind::Notification,
                sender: n.package_name.clone(),
                content,
                sim_slot: 0,
                timestamp: n.timestamp.unwrap_or_else(Utc::now),
                app_package: Some(n.package_name),
                title: Some(n.title).filter(|t| !t.is_empty()),
            },
        )
        .await
    }

    /// Log, match and fan out one inbound event.
    async fn route(&self, origin: Origin, event: InboundEvent) -> usize {
        let log_id = self.log_inbound(origin, &event).await;

        let rules = match self
            .matcher
            .match_event(origin.device_id, event.trigger, &event.sender, &event.content)
            .await
        {
            Ok(rules) => rules,
            Err(e) => {
                error!(device_id = %origin.device_id, trigger = %event.trigger, "Rule lookup failed: {e}");
                return 0;
            }
        };
        if rules.is_empty() {
            debug!(device_id = %origin.device_id, trigger = %event.trigger, "No rules matched");
            return 0;
        }

        let payload = WebhookEvent {
            kind: event.trigger,
            device_id: origin.device_id,
            sender: event.sender,
            content: event.content,
            timestamp: event.timestamp,
            app_package: event.app_package,
            title: event.title,
        };

        let mut enqueued = 0;
        for rule in &rules {
            let job = DeliveryJob::for_rule(rule, payload.clone(), log_id);
            let job_id = job.id;
            match self.queue.enqueue(job).await {
                Ok(()) => enqueued += 1,
                Err(e) => error!(rule_id = rule.id, job_id = %job_id, "Failed to enqueue delivery: {e}"),
            }
        }
        info!(
            device_id = %origin.device_id,
            trigger = %payload.kind,
            matched = rules.len(),
            enqueued,
            "Event routed"
        );
        enqueued
    }

    async fn log_inbound(&self, origin: Origin, event: &InboundEvent) -> Option<LogId> {
        let entry = NewLogEntry {
            user_id: origin.user_id,
            device_id: Some(origin.device_id),
            direction: LogDirection::Inbound,
            sender: event.sender.clone(),
            receiver: String::new(),
            content: event.content.clone(),
            sim_slot: event.sim_slot,
        };
        match self.stores.logs.create(entry).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(device_id = %origin.device_id, "Failed to create inbound log entry: {e}");
                None
            }
        }
    }

    /// Apply a device's delivery report to the outbound log entry it names.
    /// Only the device the command was sent to may report on it.
    async fn report_outbound(
        &self,
        origin: Origin,
        request_id: &str,
        status: LogStatus,
        error: Option<String>,
    ) {
        let Ok(log_id) = request_id.parse::<LogId>() else {
            warn!(request_id, "Delivery report with unknown request id");
            return;
        };
        match self.stores.logs.find(log_id).await {
            Ok(Some(entry))
                if entry.direction == LogDirection::Outbound
                    && entry.user_id == origin.user_id
                    && entry.device_id == Some(origin.device_id) => {}
            Ok(_) => {
                warn!(
                    device_id = %origin.device_id,
                    log_id,
                    "Ignoring delivery report for an entry this device did not send"
                );
                return;
            }
            Err(e) => {
                warn!(log_id, "Failed to look up outbound SMS: {e}");
                return;
            }
        }
        match self.stores.logs.update_status(log_id, status, error).await {
            Ok(()) => debug!(log_id, status = status.as_str(), "Outbound SMS status updated"),
            Err(e) => warn!(log_id, "Failed to update outbound SMS status: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::webhook::WebhookTransport;
    use crate::delivery::{QueueSettings, RetryPolicy};
    use crate::error::DispatchError;
    use crate::models::{Device, ForwardingRule, HttpMethod};
    use crate::store::memory::MemoryStore;
    use crate::store::LogSink;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    /// Transport that records every job it is asked to deliver.
    #[derive(Default)]
    struct Recorder {
        jobs: Mutex<Vec<DeliveryJob>>,
    }

    #[async_trait]
    impl WebhookTransport for Recorder {
        async fn deliver(&self, job: &DeliveryJob) -> Result<(), DispatchError> {
            self.jobs.lock().unwrap().push(job.clone());
            Ok(())
        }
    }

    struct Fixture {
        router: EventRouter,
        store: Arc<MemoryStore>,
        recorder: Arc<Recorder>,
        origin: Origin,
        _dir: tempfile::TempDir,
    }

    async fn fixture(rules: Vec<(TriggerKind, Option<&str>)>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        let device = Uuid::new_v4();
        store
            .add_device(Device {
                id: device,
                user_id: user,
                name: "Pixel".into(),
                device_uid: "uid-1".into(),
                battery: 0,
                online: true,
            })
            .await;
        for (trigger, sender_filter) in rules {
            store
                .add_rule(ForwardingRule {
                    id: 0,
                    user_id: user,
                    device_id: None,
                    trigger,
                    sender_filter: sender_filter.map(str::to_string),
                    content_filter: None,
                    webhook_url: "http://127.0.0.1:1/hook".into(),
                    method: HttpMethod::Post,
                    secret_header: Some("s3cret".into()),
                    is_active: true,
                })
                .await;
        }

        let recorder = Arc::new(Recorder::default());
        let queue = DeliveryQueue::start(
            QueueSettings {
                dir: dir.path().to_path_buf(),
                workers: 1,
                retry: RetryPolicy::default(),
                compact_threshold: 100,
            },
            recorder.clone(),
            store.clone(),
        )
        .await
        .unwrap();
        let router = EventRouter::new(Stores::from_memory(store.clone()), queue);
        Fixture {
            router,
            store,
            recorder,
            origin: Origin {
                device_id: device,
                user_id: user,
            },
            _dir: dir,
        }
    }

    async fn delivered(recorder: &Recorder, count: usize) -> Vec<DeliveryJob> {
        for _ in 0..200 {
            let jobs = recorder.jobs.lock().unwrap().clone();
            if jobs.len() >= count {
                return jobs;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} deliveries");
    }

    fn sms(sender: &str, content: &str) -> DeviceMessage {
        DeviceMessage::SmsReceived(SmsReceivedData {
            sender: sender.into(),
            content: content.into(),
            sim_slot: 1,
            timestamp: None,
        })
    }

    #[tokio::test]
    async fn test_sms_fans_out_one_job_per_matching_rule() {
        let f = fixture(vec![
            (TriggerKind::Sms, None),
            (TriggerKind::Sms, Some(r"^\+84")),
            (TriggerKind::Sms, Some(r"^\+1")),
            (TriggerKind::Notification, None),
        ])
        .await;

        let enqueued = f.router.handle(f.origin, sms("+84123456789", "OTP 1234")).await;
        assert_eq!(enqueued, 2);

        let jobs = delivered(&f.recorder, 2).await;
        let (log_id, record) = f.store.logs().await.pop().unwrap();
        assert_eq!(record.entry.sender, "+84123456789");
        assert_eq!(record.entry.sim_slot, 1);
        for job in &jobs {
            assert_eq!(job.log_id, Some(log_id));
            assert_eq!(job.event.kind, TriggerKind::Sms);
            assert_eq!(job.event.content, "OTP 1234");
            assert_eq!(job.secret_header.as_deref(), Some("s3cret"));
        }
        let mut rule_ids: Vec<_> = jobs.iter().map(|j| j.rule_id).collect();
        rule_ids.sort_unstable();
        assert_eq!(rule_ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_notification_payload() {
        let f = fixture(vec![(TriggerKind::Notification, Some("bank"))]).await;
        let msg = DeviceMessage::NotificationReceived(NotificationReceivedData {
            package_name: "com.bank.app".into(),
            title: "Transfer".into(),
            content: "+500".into(),
            timestamp: None,
        });
        assert_eq!(f.router.handle(f.origin, msg).await, 1);

        let jobs = delivered(&f.recorder, 1).await;
        let event = &jobs[0].event;
        assert_eq!(event.sender, "com.bank.app");
        assert_eq!(event.content, "Transfer\n+500");
        assert_eq!(event.app_package.as_deref(), Some("com.bank.app"));
        assert_eq!(event.title.as_deref(), Some("Transfer"));
    }

    #[tokio::test]
    async fn test_no_match_creates_log_but_no_job() {
        let f = fixture(vec![(TriggerKind::Sms, Some("^never$"))]).await;
        assert_eq!(f.router.handle(f.origin, sms("+100", "hi")).await, 0);
        assert_eq!(f.store.logs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_reports_update_outbound_log() {
        let f = fixture(vec![]).await;
        let sent = f
            .store
            .create(NewLogEntry {
                user_id: f.origin.user_id,
                device_id: Some(f.origin.device_id),
                direction: LogDirection::Outbound,
                sender: String::new(),
                receiver: "+100".into(),
                content: "hi".into(),
                sim_slot: 0,
            })
            .await
            .unwrap();
        let failed = sent + 1;
        f.store
            .create(NewLogEntry {
                user_id: f.origin.user_id,
                device_id: Some(f.origin.device_id),
                direction: LogDirection::Outbound,
                sender: String::new(),
                receiver: "+200".into(),
                content: "hi".into(),
                sim_slot: 0,
            })
            .await
            .unwrap();

        f.router
            .handle(
                f.origin,
                DeviceMessage::SmsSent(SmsSentData {
                    request_id: sent.to_string(),
                }),
            )
            .await;
        f.router
            .handle(
                f.origin,
                DeviceMessage::SmsFailed(SmsFailedData {
                    request_id: failed.to_string(),
                    error: "no signal".into(),
                }),
            )
            .await;
        // Garbage ids are ignored.
        f.router
            .handle(
                f.origin,
                DeviceMessage::SmsSent(SmsSentData {
                    request_id: "abc".into(),
                }),
            )
            .await;

        assert_eq!(f.store.log(sent).await.unwrap().status, LogStatus::Sent);
        let record = f.store.log(failed).await.unwrap();
        assert_eq!(record.status, LogStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("no signal"));
    }

    #[tokio::test]
    async fn test_reports_from_other_devices_are_ignored() {
        let f = fixture(vec![]).await;
        let outbound = f
            .store
            .create(NewLogEntry {
                user_id: f.origin.user_id,
                device_id: Some(f.origin.device_id),
                direction: LogDirection::Outbound,
                sender: String::new(),
                receiver: "+100".into(),
                content: "hi".into(),
                sim_slot: 0,
            })
            .await
            .unwrap();
        let inbound = f
            .store
            .create(NewLogEntry {
                user_id: f.origin.user_id,
                device_id: Some(f.origin.device_id),
                direction: LogDirection::Inbound,
                sender: "+300".into(),
                receiver: String::new(),
                content: "hey".into(),
                sim_slot: 0,
            })
            .await
            .unwrap();

        let stranger = Origin {
            device_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        };
        f.router
            .handle(
                stranger,
                DeviceMessage::SmsFailed(SmsFailedData {
                    request_id: outbound.to_string(),
                    error: "spoofed".into(),
                }),
            )
            .await;
        // Inbound entries cannot be reported on at all.
        f.router
            .handle(
                f.origin,
                DeviceMessage::SmsSent(SmsSentData {
                    request_id: inbound.to_string(),
                }),
            )
            .await;

        let record = f.store.log(outbound).await.unwrap();
        assert_eq!(record.status, LogStatus::Pending);
        assert!(record.error.is_none());
        assert_eq!(f.store.log(inbound).await.unwrap().status, LogStatus::Pending);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_battery() {
        let f = fixture(vec![]).await;
        f.router
            .handle(
                f.origin,
                DeviceMessage::Ping(crate::protocol::PingData {
                    battery: 42,
                    signal: 3,
                }),
            )
            .await;
        assert_eq!(f.store.device(f.origin.device_id).await.unwrap().battery, 42);
    }
}
