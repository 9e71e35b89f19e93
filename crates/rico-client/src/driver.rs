//! Session driver: issue a fixed sequence of messages one at a time and
//! collect the per-message outcomes.

use crate::{ClientError, ClientSession};
use serde::Serialize;
use std::time::Duration;
use tokio::time;
use tracing::{info, warn};

/// What happened to one message of a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOutcome {
    /// The server answered within the timeout.
    Answered { response: String },
    /// No response arrived within the timeout; the request slot was reclaimed.
    NoResponse,
    /// The request failed outright (write failure, connection gone, ...).
    Failed { reason: String },
}

/// One message of a driven sequence together with its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct SequenceReport {
    pub message: String,
    pub outcome: MessageOutcome,
}

/// Send `messages` serially, pausing `pacing` between them, and report each
/// outcome in order.
///
/// Serial issuance with a pacing delay mirrors the reference demo; it keeps
/// at most one request in flight and is not a throughput strategy. A timed
/// out or failed message does not stop the sequence.
pub async fn run_message_sequence(
    session: &ClientSession,
    messages: &[String],
    pacing: Duration,
) -> Vec<SequenceReport> {
    let mut reports = Vec::with_capacity(messages.len());
    for (index, message) in messages.iter().enumerate() {
        let outcome = match session.send_text(message).await {
            Ok(response) => {
                info!(
                    target: "ricochet::client",
                    index,
                    response = %response,
                    "response received"
                );
                MessageOutcome::Answered { response }
            }
            Err(ClientError::ResponseTimeout { stream }) => {
                warn!(
                    target: "ricochet::client",
                    index,
                    stream,
                    "no response received"
                );
                MessageOutcome::NoResponse
            }
            Err(err) => {
                warn!(target: "ricochet::client", index, error = %err, "request failed");
                MessageOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        };
        reports.push(SequenceReport {
            message: message.clone(),
            outcome,
        });
        if index + 1 < messages.len() && !pacing.is_zero() {
            time::sleep(pacing).await;
        }
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TracingObserver;
    use rico_core::{memory_link_pair, LinkEvent};
    use std::sync::Arc;

    #[tokio::test]
    async fn sequence_outcomes_arrive_in_issue_order() {
        let (client_link, server_link) = memory_link_pair(8);
        tokio::spawn(async move {
            while let Ok(event) = server_link.next_event().await {
                if let LinkEvent::StreamData { stream, payload } = event {
                    let mut reply = b"server received: ".to_vec();
                    reply.extend_from_slice(&payload);
                    if server_link.send(stream, &reply).await.is_err() {
                        break;
                    }
                }
            }
        });
        let session =
            ClientSession::over_link(client_link, Duration::from_secs(1), Arc::new(TracingObserver));

        let messages: Vec<String> = ["A", "B", "C"].iter().map(|m| m.to_string()).collect();
        let reports = run_message_sequence(&session, &messages, Duration::ZERO).await;

        assert_eq!(reports.len(), 3);
        for (report, sent) in reports.iter().zip(&messages) {
            assert_eq!(&report.message, sent);
            match &report.outcome {
                MessageOutcome::Answered { response } => {
                    assert_eq!(response, &format!("server received: {sent}"));
                }
                other => panic!("expected answer for {sent}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn unanswered_message_reports_no_response_and_sequence_continues() {
        let (client_link, server_link) = memory_link_pair(8);
        // Answer everything except the message "B".
        tokio::spawn(async move {
            while let Ok(event) = server_link.next_event().await {
                if let LinkEvent::StreamData { stream, payload } = event {
                    if payload.as_ref() == b"B" {
                        continue;
                    }
                    let mut reply = b"server received: ".to_vec();
                    reply.extend_from_slice(&payload);
                    if server_link.send(stream, &reply).await.is_err() {
                        break;
                    }
                }
            }
        });
        let session = ClientSession::over_link(
            client_link,
            Duration::from_millis(50),
            Arc::new(TracingObserver),
        );

        let messages: Vec<String> = ["A", "B", "C"].iter().map(|m| m.to_string()).collect();
        let reports = run_message_sequence(&session, &messages, Duration::ZERO).await;

        assert!(matches!(reports[0].outcome, MessageOutcome::Answered { .. }));
        assert_eq!(reports[1].outcome, MessageOutcome::NoResponse);
        assert!(matches!(reports[2].outcome, MessageOutcome::Answered { .. }));
    }

    #[test]
    fn reports_serialize_for_operator_output() {
        let report = SequenceReport {
            message: "A".to_string(),
            outcome: MessageOutcome::Answered {
                response: "server received: A".to_string(),
            },
        };
        let json = serde_json::to_string(&report).expect("serialize");
        assert!(json.contains("\"answered\""));
        assert!(json.contains("server received: A"));
    }
}
