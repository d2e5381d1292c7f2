use uuid::Uuid;

/// Simple action logger: one structured event when an action starts, one when it ends.
pub fn log_event(action_type: &str, status: &str, target: &str, error_message: Option<&str>) -> Uuid {
    log_event_with_metadata(action_type, status, target, error_message, None)
}

/// Log event with metadata (context info)
pub fn log_event_with_metadata(
    action_type: &str,
    status: &str,
    target: &str,
    error_message: Option<&str>,
    metadata: Option<serde_json::Value>,
) -> Uuid {
    let log_id = Uuid::new_v4();
    let metadata = metadata.map(|m| m.to_string()).unwrap_or_default();

    tracing::info!(
        log_id = %log_id,
        action = action_type,
        status = status,
        target = target,
        error = error_message.unwrap_or(""),
        metadata = %metadata,
        "📝 [orchestrator] {} - {} ({})",
        action_type,
        status,
        target
    );
    log_id
}

/// Log event completion with duration
pub fn log_event_complete(log_id: Uuid, status: &str, duration_ms: u64, error_message: Option<&str>) {
    match error_message {
        Some(err) => tracing::warn!(
            log_id = %log_id,
            status = status,
            duration_ms = duration_ms,
            error = err,
            "📝 [orchestrator] {} after {}ms: {}",
            status,
            duration_ms,
            err
        ),
        None => tracing::info!(
            log_id = %log_id,
            status = status,
            duration_ms = duration_ms,
            "📝 [orchestrator] {} after {}ms",
            status,
            duration_ms
        ),
    }
}
