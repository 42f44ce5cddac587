//! Deletion stream consumer.
//!
//! The queue carries three event shapes, discriminated by `type`:
//! policy-id batches, subject batches with a timestamp bound, and
//! template/subject pairs. Malformed events are dropped and acknowledged
//! (redelivery cannot fix them); an event is only acknowledged once it has
//! been handed to the indexer, so a crash in between redelivers it.
use super::DELETE_BATCH_SIZE;
use crate::metrics::record_deletion_event;
use crate::queue::DeletionQueue;
use crate::shutdown::Shutdown;
use crate::sync::indexer::{DeleteEvent, Indexer, TemplateSubject};
use argus_policy::Subject;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PolicyIdsData {
    policy_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct SubjectsData {
    subjects: Vec<Subject>,
}

#[derive(Debug, Deserialize)]
struct TemplateSubjectsData {
    subject_templates: Vec<RawTemplateSubject>,
}

#[derive(Debug, Deserialize)]
struct RawTemplateSubject {
    template_id: i64,
    subject: Subject,
}

fn parse_event(raw: &str) -> Result<DeleteEvent, String> {
    let event: RawEvent =
        serde_json::from_str(raw).map_err(|err| format!("event not decodable: {err}"))?;

    match event.event_type.as_str() {
        "policy" => {
            let data: PolicyIdsData = serde_json::from_value(event.data)
                .map_err(|err| format!("policy event data invalid: {err}"))?;
            Ok(DeleteEvent::Policies(data.policy_ids))
        }
        "subject" => {
            let data: SubjectsData = serde_json::from_value(event.data)
                .map_err(|err| format!("subject event data invalid: {err}"))?;
            let mut subjects = data.subjects;
            for subject in &mut subjects {
                subject.fill_uid();
            }
            Ok(DeleteEvent::Subjects {
                timestamp: event.timestamp,
                subjects,
            })
        }
        "subject_template" => {
            let data: TemplateSubjectsData = serde_json::from_value(event.data)
                .map_err(|err| format!("subject_template event data invalid: {err}"))?;
            let entries = data
                .subject_templates
                .into_iter()
                .map(|entry| {
                    let mut subject = entry.subject;
                    subject.fill_uid();
                    TemplateSubject {
                        template_id: entry.template_id,
                        subject,
                    }
                })
                .collect();
            Ok(DeleteEvent::TemplateSubjects {
                timestamp: event.timestamp,
                entries,
            })
        }
        other => Err(format!("unsupported event type: {other}")),
    }
}

fn event_type_label(event: &DeleteEvent) -> &'static str {
    match event {
        DeleteEvent::Policies(_) => "policy",
        DeleteEvent::Subjects { .. } => "subject",
        DeleteEvent::TemplateSubjects { .. } => "subject_template",
    }
}

pub fn start_delete_sync(
    queue: Arc<dyn DeletionQueue>,
    indexer: Indexer,
    interval: u64,
    mut shutdown: Shutdown,
) {
    info!(interval, "start deletion stream consumer");
    tokio::spawn(async move {
        match queue.recover().await {
            Ok(0) => {}
            Ok(count) => info!(count, "requeued deletion events orphaned by a previous run"),
            Err(err) => error!(error = %err, "deletion queue recovery failed"),
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    drain_events(&queue, &indexer).await;
                }
                _ = shutdown.cancelled() => {
                    info!("shutdown, the deletion stream consumer stops");
                    return;
                }
            }
        }
    });
}

/// Consumes up to a batch of events per tick. Broker errors end the tick;
/// the next one retries with the broker's redelivery intact.
async fn drain_events(queue: &Arc<dyn DeletionQueue>, indexer: &Indexer) {
    for _ in 0..DELETE_BATCH_SIZE {
        let raw = match queue.pull().await {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(err) => {
                error!(error = %err, "deletion event pull failed, backing off to next tick");
                return;
            }
        };

        match parse_event(&raw) {
            Ok(event) => {
                record_deletion_event(event_type_label(&event));
                if indexer.delete_by_event(event).await.is_err() {
                    // indexer gone (shutdown); leave the event unacked
                    warn!("indexer unavailable, leaving deletion event for redelivery");
                    return;
                }
                if let Err(err) = queue.ack(&raw).await {
                    error!(error = %err, "deletion event ack failed");
                }
            }
            Err(reason) => {
                // malformed events are dropped: redelivery will not help
                warn!(%reason, event = %raw, "dropping malformed deletion event");
                if let Err(err) = queue.ack(&raw).await {
                    error!(error = %err, "malformed deletion event ack failed");
                }
            }
        }
    }
}
