use super::*;

fn message_with(pairs: &[(&str, &str)]) -> Message {
    Message::new(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        None,
    )
}

#[test]
fn test_header_accessors() {
    let msg = message_with(&[
        (headers::MESSAGE_ID, "42"),
        (headers::MESSAGE_NAME, "order.created"),
        (headers::GROUP, "billing.v1"),
        (headers::CORRELATION_ID, "42"),
        (headers::CORRELATION_SEQUENCE, "3"),
    ]);

    assert_eq!(msg.id(), "42");
    assert_eq!(msg.name(), "order.created");
    assert_eq!(msg.group(), Some("billing.v1"));
    assert_eq!(msg.correlation_id(), Some("42"));
    assert_eq!(msg.correlation_sequence(), 3);
    assert_eq!(msg.callback_name(), None);
}

#[test]
fn test_missing_headers_default() {
    let msg = message_with(&[]);
    assert_eq!(msg.id(), "");
    assert_eq!(msg.name(), "");
    assert_eq!(msg.correlation_sequence(), 0);
}

#[test]
fn test_empty_callback_name_is_none() {
    let msg = message_with(&[(headers::CALLBACK_NAME, "")]);
    assert_eq!(msg.callback_name(), None);
}

#[test]
fn test_status_parse_round_trip() {
    for status in [
        StatusName::Scheduled,
        StatusName::Processing,
        StatusName::Succeeded,
        StatusName::Failed,
    ] {
        assert_eq!(status.as_str().parse::<StatusName>(), Ok(status));
    }
    assert!("Delayed".parse::<StatusName>().is_err());
}

#[test]
fn test_processing_is_not_durable() {
    assert!(!StatusName::Processing.is_durable());
    assert!(StatusName::Failed.is_durable());
    assert!(StatusName::Scheduled.is_retryable());
    assert!(StatusName::Failed.is_retryable());
    assert!(!StatusName::Succeeded.is_retryable());
}
