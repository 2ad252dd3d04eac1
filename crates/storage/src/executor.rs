use std::time::{Duration, Instant};

use tablegate_contracts::{ErrorKind, Failure, StorageCommand, StorageOutput};
use tracing::Instrument;

use crate::StorageEngine;

/// Runs exactly one command against `engine`. A call that outlives `deadline`
/// is reported as `Unavailable`; nothing is retried.
pub async fn execute<E: StorageEngine>(
    engine: &E,
    command: StorageCommand,
    deadline: Duration,
) -> Result<StorageOutput, Failure> {
    let span = tracing::info_span!(
        "storage.execute",
        action = command.action_label(),
        key = command.key().unwrap_or("-"),
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    async move {
        let started = Instant::now();
        let result = match tokio::time::timeout(deadline, dispatch(engine, command)).await {
            Ok(result) => result,
            Err(_) => Err(Failure::new(
                ErrorKind::Unavailable,
                "storage did not answer before the deadline",
            )),
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::Span::current().record("latency_ms", latency_ms);
        match &result {
            Ok(_) => tracing::Span::current().record("outcome", "ok"),
            Err(failure) => tracing::Span::current().record("outcome", failure.kind.as_str()),
        };
        result
    }
    .instrument(span)
    .await
}

async fn dispatch<E: StorageEngine>(
    engine: &E,
    command: StorageCommand,
) -> Result<StorageOutput, Failure> {
    match command {
        StorageCommand::PutItem { record } => {
            let id = record.id.clone();
            engine.put_item(record).await.map_err(native::<E>)?;
            Ok(StorageOutput::Written { id })
        }
        StorageCommand::GetItem { id } => match engine.get_item(&id).await.map_err(native::<E>)? {
            Some(record) => Ok(StorageOutput::Item(record)),
            None => Err(Failure::new(ErrorKind::NotFound, public_message(ErrorKind::NotFound))),
        },
        StorageCommand::Scan => engine
            .scan()
            .await
            .map(StorageOutput::Items)
            .map_err(native::<E>),
        StorageCommand::QueryByOwner { owner_id } => engine
            .query_by_owner(&owner_id)
            .await
            .map(StorageOutput::Items)
            .map_err(native::<E>),
        StorageCommand::ConditionalUpdate {
            id,
            attributes,
            condition,
        } => {
            engine
                .update_if_owner(&id, attributes, &condition)
                .await
                .map_err(native::<E>)?;
            Ok(StorageOutput::Written { id })
        }
        StorageCommand::ConditionalDelete { id, condition } => {
            engine
                .delete_if_owner(&id, &condition)
                .await
                .map_err(native::<E>)?;
            Ok(StorageOutput::Written { id })
        }
        StorageCommand::ConditionCheck { id, condition } => {
            engine
                .check_owner(&id, &condition)
                .await
                .map_err(native::<E>)?;
            Ok(StorageOutput::Checked { id })
        }
    }
}

fn native<E: StorageEngine>(error: E::Error) -> Failure {
    let kind = E::classify(&error);
    if kind.is_storage_side() {
        tracing::warn!(error = %error, kind = kind.as_str(), "storage.native_error");
    }
    Failure::new(kind, public_message(kind))
}

/// Native error text can carry engine internals; clients only see these.
fn public_message(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::ConditionFailed => "condition check failed",
        ErrorKind::NotFound => "not found",
        ErrorKind::Throttled => "storage throttled the request",
        ErrorKind::Unavailable => "storage unavailable",
        ErrorKind::MalformedRequest => "storage rejected the request",
        ErrorKind::Unauthorized => "storage rejected the caller",
        ErrorKind::Unknown => "storage error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryEngine;
    use tablegate_contracts::{AttrValue, Attributes, OwnershipCondition, Record};

    const DEADLINE: Duration = Duration::from_secs(5);

    fn record(id: &str, owner: &str) -> Record {
        Record {
            id: id.to_string(),
            owner_id: owner.to_string(),
            created_at: "2026-10-16T00:00:00Z".to_string(),
            attributes: Attributes::from([("name".to_string(), AttrValue::from("Fluffy"))]),
        }
    }

    #[derive(Debug)]
    struct StalledError;

    impl std::fmt::Display for StalledError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "stalled")
        }
    }

    impl std::error::Error for StalledError {}

    /// Never answers within any reasonable deadline.
    struct StalledEngine;

    impl StorageEngine for StalledEngine {
        type Error = StalledError;

        async fn put_item(&self, _record: Record) -> Result<(), Self::Error> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn get_item(&self, _id: &str) -> Result<Option<Record>, Self::Error> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }

        async fn scan(&self) -> Result<Vec<Record>, Self::Error> {
            Err(StalledError)
        }

        async fn query_by_owner(&self, _owner_id: &str) -> Result<Vec<Record>, Self::Error> {
            Err(StalledError)
        }

        async fn update_if_owner(
            &self,
            _id: &str,
            _attributes: Attributes,
            _condition: &OwnershipCondition,
        ) -> Result<(), Self::Error> {
            Err(StalledError)
        }

        async fn delete_if_owner(
            &self,
            _id: &str,
            _condition: &OwnershipCondition,
        ) -> Result<(), Self::Error> {
            Err(StalledError)
        }

        async fn check_owner(
            &self,
            _id: &str,
            _condition: &OwnershipCondition,
        ) -> Result<(), Self::Error> {
            Err(StalledError)
        }

        fn classify(_error: &Self::Error) -> ErrorKind {
            ErrorKind::Unknown
        }
    }

    #[tokio::test]
    async fn deadline_elapsed_is_unavailable() {
        let err = execute(
            &StalledEngine,
            StorageCommand::GetItem {
                id: "X".to_string(),
            },
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn native_errors_are_classified_with_public_messages() {
        let err = execute(&StalledEngine, StorageCommand::Scan, DEADLINE)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert_eq!(err.message, "storage error");
    }

    #[tokio::test]
    async fn missing_point_lookup_is_not_found() {
        let engine = MemoryEngine::new();
        let err = execute(
            &engine,
            StorageCommand::GetItem {
                id: "missing".to_string(),
            },
            DEADLINE,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.message, "not found");
    }

    #[tokio::test]
    async fn each_command_maps_to_its_output_shape() {
        let engine = MemoryEngine::new();

        let put = execute(
            &engine,
            StorageCommand::PutItem {
                record: record("A", "P1"),
            },
            DEADLINE,
        )
        .await
        .unwrap();
        assert_eq!(
            put,
            StorageOutput::Written {
                id: "A".to_string()
            }
        );

        let item = execute(
            &engine,
            StorageCommand::GetItem {
                id: "A".to_string(),
            },
            DEADLINE,
        )
        .await
        .unwrap();
        assert_eq!(item, StorageOutput::Item(record("A", "P1")));

        let scan = execute(&engine, StorageCommand::Scan, DEADLINE)
            .await
            .unwrap();
        assert_eq!(scan, StorageOutput::Items(vec![record("A", "P1")]));

        let checked = execute(
            &engine,
            StorageCommand::ConditionCheck {
                id: "A".to_string(),
                condition: OwnershipCondition::new("P1"),
            },
            DEADLINE,
        )
        .await
        .unwrap();
        assert_eq!(
            checked,
            StorageOutput::Checked {
                id: "A".to_string()
            }
        );

        let deleted = execute(
            &engine,
            StorageCommand::ConditionalDelete {
                id: "A".to_string(),
                condition: OwnershipCondition::new("P1"),
            },
            DEADLINE,
        )
        .await
        .unwrap();
        assert_eq!(
            deleted,
            StorageOutput::Written {
                id: "A".to_string()
            }
        );
    }

    #[tokio::test]
    async fn ownership_mismatch_is_condition_failed() {
        let engine = MemoryEngine::new();
        execute(
            &engine,
            StorageCommand::PutItem {
                record: record("A", "P1"),
            },
            DEADLINE,
        )
        .await
        .unwrap();

        for command in [
            StorageCommand::ConditionalUpdate {
                id: "A".to_string(),
                attributes: Attributes::from([("name".to_string(), AttrValue::from("Rex"))]),
                condition: OwnershipCondition::new("P2"),
            },
            StorageCommand::ConditionalDelete {
                id: "A".to_string(),
                condition: OwnershipCondition::new("P2"),
            },
            StorageCommand::ConditionCheck {
                id: "A".to_string(),
                condition: OwnershipCondition::new("P2"),
            },
        ] {
            let err = execute(&engine, command, DEADLINE).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::ConditionFailed);
        }
    }

    #[tokio::test]
    async fn throttled_engine_reports_throttled() {
        let engine = MemoryEngine::with_throughput(1, Duration::from_secs(60));
        execute(&engine, StorageCommand::Scan, DEADLINE)
            .await
            .unwrap();
        let err = execute(&engine, StorageCommand::Scan, DEADLINE)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Throttled);
    }
}
