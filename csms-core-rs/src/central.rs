//! Default central system handlers for charge point requests
//!
//! Accept-everything responders for the OCPP 1.6 Core profile: every charge
//! point is registered, every idTag is authorized and transactions get ids
//! from an in-memory counter. Persisting transactions is left to whoever
//! replaces these handlers.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::handlers::{constraint_violation, HandlerRegistry};
use crate::ocpp::types::*;
use crate::ocpp::Action;

/// Heartbeat interval handed out in BootNotification responses (seconds)
pub const DEFAULT_HEARTBEAT_INTERVAL: i32 = 10;

/// First transaction id allocated by StartTransaction
pub const FIRST_TRANSACTION_ID: i32 = 12345;

/// Build a registry answering the OCPP 1.6 Core charge point requests
pub fn default_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    register_core_handlers(&mut registry, DEFAULT_HEARTBEAT_INTERVAL);
    registry
}

/// Register the Core profile handlers on an existing registry
pub fn register_core_handlers(registry: &mut HandlerRegistry, heartbeat_interval: i32) {
    let transaction_ids = Arc::new(AtomicI32::new(FIRST_TRANSACTION_ID));

    registry.register_typed(
        Action::BootNotification.as_str(),
        move |ctx, req: BootNotificationRequest| async move {
            info!(
                "{}: BootNotification from {} {}",
                ctx.identity, req.charge_point_vendor, req.charge_point_model
            );
            Ok(BootNotificationResponse {
                current_time: Utc::now(),
                interval: heartbeat_interval,
                status: RegistrationStatus::Accepted,
            })
        },
    );

    registry.register_typed(
        Action::Heartbeat.as_str(),
        |ctx, _req: HeartbeatRequest| async move {
            debug!("{}: Heartbeat", ctx.identity);
            Ok(HeartbeatResponse {
                current_time: Utc::now(),
            })
        },
    );

    registry.register_typed(
        Action::Authorize.as_str(),
        |ctx, req: AuthorizeRequest| async move {
            info!("{}: Authorize {}", ctx.identity, req.id_tag);
            Ok(AuthorizeResponse {
                id_tag_info: IdTagInfo::accepted(),
            })
        },
    );

    registry.register_typed(
        Action::StartTransaction.as_str(),
        move |ctx, req: StartTransactionRequest| {
            let transaction_ids = transaction_ids.clone();
            async move {
                if req.connector_id < 1 {
                    return Err(constraint_violation("connectorId must be greater than 0"));
                }
                let transaction_id = transaction_ids.fetch_add(1, Ordering::Relaxed);
                info!(
                    "{}: charging started on connector {} for {} (transaction {})",
                    ctx.identity, req.connector_id, req.id_tag, transaction_id
                );
                Ok(StartTransactionResponse {
                    transaction_id,
                    id_tag_info: IdTagInfo::accepted(),
                })
            }
        },
    );

    registry.register_typed(
        Action::StopTransaction.as_str(),
        |ctx, req: StopTransactionRequest| async move {
            info!(
                "{}: transaction {} stopped at meter {} ({:?})",
                ctx.identity, req.transaction_id, req.meter_stop, req.reason
            );
            Ok(StopTransactionResponse {
                id_tag_info: req.id_tag.as_ref().map(|_| IdTagInfo::accepted()),
            })
        },
    );

    registry.register_typed(
        Action::StatusNotification.as_str(),
        |ctx, req: StatusNotificationRequest| async move {
            info!(
                "{}: connector {} is {:?} ({:?})",
                ctx.identity, req.connector_id, req.status, req.error_code
            );
            Ok(StatusNotificationResponse {})
        },
    );

    registry.register_typed(
        Action::MeterValues.as_str(),
        |ctx, req: MeterValuesRequest| async move {
            debug!(
                "{}: {} meter values on connector {}",
                ctx.identity,
                req.meter_value.len(),
                req.connector_id
            );
            Ok(MeterValuesResponse {})
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::{Call, ErrorCode, OcppMessage};
    use serde_json::{json, Value};

    async fn send(registry: &HandlerRegistry, action: &str, payload: Value) -> OcppMessage {
        registry
            .dispatch("CP-1", Call::new("m-1", action, payload).unwrap())
            .await
    }

    fn result_payload(msg: OcppMessage) -> Value {
        match msg {
            OcppMessage::CallResult(result) => result.payload,
            other => panic!("Expected CallResult, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_boot_notification_accepted() {
        let registry = default_registry();
        let payload = result_payload(
            send(
                &registry,
                "BootNotification",
                json!({"chargePointModel": "EVSE-123", "chargePointVendor": "EV-Charger Inc."}),
            )
            .await,
        );

        assert_eq!(payload["status"], "Accepted");
        assert_eq!(payload["interval"], DEFAULT_HEARTBEAT_INTERVAL);
    }

    #[tokio::test]
    async fn test_boot_notification_missing_fields() {
        let registry = default_registry();
        match send(&registry, "BootNotification", json!({"chargePointModel": "EVSE-123"})).await {
            OcppMessage::CallError(err) => {
                assert_eq!(err.error_code, ErrorCode::OccurrenceConstraintViolation)
            }
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_transaction_allocates_ids() {
        let registry = default_registry();
        let request = json!({
            "connectorId": 1,
            "idTag": "TAG-1",
            "meterStart": 0,
            "timestamp": "2025-02-26T12:00:00Z"
        });

        let first = result_payload(send(&registry, "StartTransaction", request.clone()).await);
        let second = result_payload(send(&registry, "StartTransaction", request).await);

        assert_eq!(first["transactionId"], FIRST_TRANSACTION_ID);
        assert_eq!(second["transactionId"], FIRST_TRANSACTION_ID + 1);
        assert_eq!(first["idTagInfo"]["status"], "Accepted");
    }

    #[tokio::test]
    async fn test_start_transaction_rejects_connector_zero() {
        let registry = default_registry();
        let request = json!({
            "connectorId": 0,
            "idTag": "TAG-1",
            "meterStart": 0,
            "timestamp": "2025-02-26T12:00:00Z"
        });

        match send(&registry, "StartTransaction", request).await {
            OcppMessage::CallError(err) => {
                assert_eq!(err.error_code, ErrorCode::PropertyConstraintViolation)
            }
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_simple_notifications() {
        let registry = default_registry();

        let heartbeat = result_payload(send(&registry, "Heartbeat", json!({})).await);
        assert!(heartbeat["currentTime"].is_string());

        let status = result_payload(
            send(
                &registry,
                "StatusNotification",
                json!({"connectorId": 1, "errorCode": "NoError", "status": "Available"}),
            )
            .await,
        );
        assert_eq!(status, json!({}));

        let stop = result_payload(
            send(
                &registry,
                "StopTransaction",
                json!({"transactionId": 12345, "meterStop": 420, "timestamp": "2025-02-26T12:30:00Z"}),
            )
            .await,
        );
        assert_eq!(stop, json!({}));
    }

    #[test]
    fn test_registered_actions() {
        assert_eq!(
            default_registry().actions(),
            vec![
                "Authorize",
                "BootNotification",
                "Heartbeat",
                "MeterValues",
                "StartTransaction",
                "StatusNotification",
                "StopTransaction"
            ]
        );
    }
}
