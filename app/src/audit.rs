// ==============================================================================
// audit.rs - Audit Logging for Variant Loads
// ==============================================================================
// Description: Audit trail of load runs persisted next to the documents
// Author: Matt Barham
// Created: 2025-10-31
// Modified: 2026-10-17
// Version: 2.0.0
// ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::loader::LoadSummary;

const CREATE_AUDIT_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS variant_load_audit (
        id          UUID        PRIMARY KEY,
        timestamp   TIMESTAMPTZ NOT NULL,
        event_type  TEXT        NOT NULL,
        load_id     UUID        NOT NULL,
        study_id    INTEGER     NOT NULL,
        resource    TEXT,
        details     JSONB       NOT NULL,
        severity    TEXT        NOT NULL
    )
"#;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    LoadStarted,
    LoadCompleted,
    LoadFailed,
    BatchSkipped,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::LoadStarted => "load_started",
            AuditEventType::LoadCompleted => "load_completed",
            AuditEventType::LoadFailed => "load_failed",
            AuditEventType::BatchSkipped => "batch_skipped",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Info,
    Warning,
    Error,
}

impl LogSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSeverity::Info => "info",
            LogSeverity::Warning => "warning",
            LogSeverity::Error => "error",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub load_id: Uuid,
    pub study_id: i32,
    pub resource: Option<String>,
    pub details: serde_json::Value,
    pub severity: LogSeverity,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        load_id: Uuid,
        study_id: i32,
        resource: Option<String>,
        details: serde_json::Value,
    ) -> Self {
        let severity = match event_type {
            AuditEventType::BatchSkipped => LogSeverity::Warning,
            AuditEventType::LoadFailed => LogSeverity::Error,
            _ => LogSeverity::Info,
        };

        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            load_id,
            study_id,
            resource,
            details,
            severity,
        }
    }

    pub async fn log(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO variant_load_audit (
                id, timestamp, event_type, load_id, study_id,
                resource, details, severity
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(self.id)
        .bind(self.timestamp)
        .bind(self.event_type.as_str())
        .bind(self.load_id)
        .bind(self.study_id)
        .bind(&self.resource)
        .bind(&self.details)
        .bind(self.severity.as_str())
        .execute(pool)
        .await?;

        Ok(())
    }
}

/// Create the audit table if it does not exist
pub async fn ensure_table(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(CREATE_AUDIT_TABLE).execute(pool).await?;
    Ok(())
}

/// Convenience function to log an audit event
pub async fn log_event(
    pool: &PgPool,
    event_type: AuditEventType,
    load_id: Uuid,
    study_id: i32,
    resource: Option<String>,
    details: serde_json::Value,
) -> Result<(), sqlx::Error> {
    AuditEvent::new(event_type, load_id, study_id, resource, details)
        .log(pool)
        .await
}

/// Completion event plus one event per skipped batch
pub fn completion_events(
    load_id: Uuid,
    study_id: i32,
    resource: Option<String>,
    summary: &LoadSummary,
) -> Vec<AuditEvent> {
    let mut events: Vec<AuditEvent> = summary
        .skipped
        .iter()
        .map(|skipped| {
            AuditEvent::new(
                AuditEventType::BatchSkipped,
                load_id,
                study_id,
                resource.clone(),
                serde_json::json!(skipped),
            )
        })
        .collect();

    events.push(AuditEvent::new(
        AuditEventType::LoadCompleted,
        load_id,
        study_id,
        resource,
        serde_json::json!(summary),
    ));
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{SkippedBatch, Stage};

    #[test]
    fn test_audit_event_creation() {
        let load_id = Uuid::new_v4();
        let event = AuditEvent::new(
            AuditEventType::LoadStarted,
            load_id,
            7,
            Some("chr22.vcf.gz".to_string()),
            serde_json::json!({"parallelism": 4}),
        );

        assert_eq!(event.load_id, load_id);
        assert_eq!(event.resource, Some("chr22.vcf.gz".to_string()));
        assert!(matches!(event.severity, LogSeverity::Info));
    }

    #[test]
    fn test_failure_severity() {
        let event = AuditEvent::new(
            AuditEventType::LoadFailed,
            Uuid::new_v4(),
            7,
            None,
            serde_json::json!({}),
        );

        assert!(matches!(event.severity, LogSeverity::Error));
    }

    #[test]
    fn test_event_type_matches_serde_name() {
        for event_type in [
            AuditEventType::LoadStarted,
            AuditEventType::LoadCompleted,
            AuditEventType::LoadFailed,
            AuditEventType::BatchSkipped,
        ] {
            assert_eq!(
                serde_json::to_value(event_type).unwrap(),
                serde_json::json!(event_type.as_str())
            );
        }
    }

    #[test]
    fn test_completion_events_include_skipped_batches() {
        let summary = LoadSummary {
            mode: "serial",
            sink_workers: 1,
            batches_read: 3,
            records_read: 30,
            records_written: 20,
            documents_written: 20,
            skipped: vec![SkippedBatch {
                stage: Stage::Sink,
                worker: 0,
                records: 10,
                error: "Invalid study identifier: 'x'".to_string(),
            }],
            elapsed_secs: 0.5,
        };

        let events = completion_events(Uuid::new_v4(), 7, None, &summary);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, AuditEventType::BatchSkipped);
        assert_eq!(events[0].details["records"], 10);
        assert_eq!(events[0].details["stage"], "sink");
        assert_eq!(events[1].event_type, AuditEventType::LoadCompleted);
        assert_eq!(events[1].details["records_written"], 20);
    }
}
