// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Turns one broker delivery into a dispatcher call and settles it. Every
//! delivery is settled exactly once: acknowledged when processed, rejected
//! without requeue when it is malformed or its handler failed. Unroutable
//! messages follow the dispatcher's `UnroutablePolicy`.

use crate::{
    dispatcher::{DispatchOutcome, RabbitMQDispatcher},
    errors::AmqpError,
    handler::{ConsumerMessage, ServiceContext},
    otel,
    publisher::RabbitMQPublisher,
    transport::InboundDelivery,
};
use opentelemetry::{
    global::BoxedSpan,
    trace::{Span, Status},
};
use serde_json::Value;
use std::borrow::Cow;
use tracing::{debug, error, warn};

/// Terminal decision for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Acknowledge and remove from the queue
    Ack,
    /// Negative acknowledge without requeue
    Reject,
}

/// Decodes a message body into its type and JSON payload.
///
/// The type comes from the top-level `"type"` string of the body, falling back
/// to the AMQP `type` property and then to an empty string.
pub(crate) fn parse_envelope(
    data: &[u8],
    fallback_type: Option<&str>,
) -> Result<(String, Value), AmqpError> {
    let payload: Value =
        serde_json::from_slice(data).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;

    let msg_type = payload
        .get("type")
        .and_then(Value::as_str)
        .or(fallback_type)
        .unwrap_or_default()
        .to_owned();

    Ok((msg_type, payload))
}

pub(crate) async fn consume(
    dispatcher: &RabbitMQDispatcher,
    publisher: &RabbitMQPublisher,
    delivery: InboundDelivery,
) -> Settlement {
    debug!(
        exchange = %delivery.exchange,
        routing_key = %delivery.routing_key,
        redelivered = delivery.redelivered,
        "received"
    );

    let (msg_type, payload) = match parse_envelope(&delivery.data, delivery.msg_type.as_deref()) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(
                error = err.to_string(),
                queue = dispatcher.queue(),
                "removing message from queue - reason: malformed payload"
            );
            let (_, mut span) = otel::new_span(&delivery.headers, dispatcher.queue());
            fail_span(&mut span, &err, "malformed payload");
            settle(&delivery, Settlement::Reject, &mut span).await;
            return Settlement::Reject;
        }
    };

    let (ctx, mut span) = otel::new_span(&delivery.headers, &msg_type);
    let msg = ConsumerMessage {
        queue: dispatcher.queue().to_owned(),
        msg_type,
        payload,
        redelivered: delivery.redelivered,
    };
    let ctx = ServiceContext::new(ctx, publisher.clone());

    let outcome = dispatcher.process_message(&ctx, &msg).await;
    match &outcome {
        DispatchOutcome::Processed => span.set_status(Status::Ok),
        DispatchOutcome::Failed(err) => fail_span(&mut span, err, "handler failure"),
        DispatchOutcome::Unroutable => {
            let err = AmqpError::HandlerError(format!("unsupported msg type `{}`", msg.msg_type));
            fail_span(&mut span, &err, "unsupported msg type");
        }
    }

    let settlement = outcome.settlement(dispatcher.unroutable_policy());
    settle(&delivery, settlement, &mut span).await;
    settlement
}

async fn settle(delivery: &InboundDelivery, settlement: Settlement, span: &mut BoxedSpan) {
    let result = match settlement {
        Settlement::Ack => delivery.acker.ack().await,
        Settlement::Reject => delivery.acker.nack(false).await,
    };

    if let Err(err) = result {
        error!(error = err.to_string(), ?settlement, "error whiling settling msg");
        fail_span(span, &err, "error to settle msg");
    }
}

fn fail_span(span: &mut BoxedSpan, err: &AmqpError, description: &'static str) {
    span.record_error(err);
    span.set_status(Status::Error {
        description: Cow::from(description),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configs::{RabbitMQConfigs, UnroutablePolicy},
        connection::RabbitMQConnection,
        fakes::FakeBroker,
        handler::{handler_fn, MockConsumerHandler},
        topology::AmqpTopology,
        transport::{Headers, MockAcknowledger},
    };
    use std::sync::Arc;

    fn publisher() -> RabbitMQPublisher {
        RabbitMQPublisher::new(RabbitMQConnection::new(
            RabbitMQConfigs::new("amqp://fake"),
            AmqpTopology::new(),
            FakeBroker::new().connector(),
        ))
    }

    fn delivery(body: &[u8], acker: MockAcknowledger) -> InboundDelivery {
        InboundDelivery {
            msg_type: None,
            exchange: String::new(),
            routing_key: "orders".into(),
            redelivered: false,
            headers: Headers::new(),
            data: body.to_vec(),
            acker: Box::new(acker),
        }
    }

    fn acks_once() -> MockAcknowledger {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        acker.expect_nack().never();
        acker
    }

    fn rejects_once() -> MockAcknowledger {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker
            .expect_nack()
            .withf(|requeue| !requeue)
            .times(1)
            .returning(|_| Ok(()));
        acker
    }

    fn dispatcher_with(result: Result<(), AmqpError>) -> RabbitMQDispatcher {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .times(1)
            .returning(move |_, _| result.clone());
        RabbitMQDispatcher::builder("orders")
            .register("created", Arc::new(handler))
            .build()
    }

    #[test]
    fn envelope_type_comes_from_the_body_first() {
        let (msg_type, payload) =
            parse_envelope(br#"{"type":"created","id":42}"#, Some("ignored")).unwrap();
        assert_eq!(msg_type, "created");
        assert_eq!(payload["id"], 42);

        let (msg_type, _) = parse_envelope(br#"{"id":42}"#, Some("created")).unwrap();
        assert_eq!(msg_type, "created");

        let (msg_type, _) = parse_envelope(br#"{"id":42}"#, None).unwrap();
        assert_eq!(msg_type, "");
    }

    #[test]
    fn non_json_payload_is_a_parse_error() {
        assert!(matches!(
            parse_envelope(b"not json", None),
            Err(AmqpError::ParsePayloadError(_))
        ));
        assert!(matches!(
            parse_envelope(&[0xff, 0xfe], None),
            Err(AmqpError::ParsePayloadError(_))
        ));
    }

    #[tokio::test]
    async fn processed_message_is_acked_exactly_once() {
        let dispatcher = dispatcher_with(Ok(()));

        let settlement = consume(
            &dispatcher,
            &publisher(),
            delivery(br#"{"type":"created","id":1}"#, acks_once()),
        )
        .await;

        assert_eq!(settlement, Settlement::Ack);
    }

    #[tokio::test]
    async fn handler_failure_rejects_without_requeue() {
        let dispatcher = dispatcher_with(Err(AmqpError::handler("invalid order")));

        let settlement = consume(
            &dispatcher,
            &publisher(),
            delivery(br#"{"type":"created","id":1}"#, rejects_once()),
        )
        .await;

        assert_eq!(settlement, Settlement::Reject);
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected_without_calling_handlers() {
        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().never();
        let dispatcher = RabbitMQDispatcher::builder("orders")
            .register("created", Arc::new(handler))
            .build();

        let settlement =
            consume(&dispatcher, &publisher(), delivery(b"{oops", rejects_once())).await;

        assert_eq!(settlement, Settlement::Reject);
    }

    #[tokio::test]
    async fn unknown_type_follows_the_unroutable_policy() {
        let dispatcher = RabbitMQDispatcher::builder("orders").build();
        let settlement = consume(
            &dispatcher,
            &publisher(),
            delivery(br#"{"type":"unknown"}"#, acks_once()),
        )
        .await;
        assert_eq!(settlement, Settlement::Ack);

        let dispatcher = RabbitMQDispatcher::builder("orders")
            .unroutable_policy(UnroutablePolicy::DeadLetter)
            .build();
        let settlement = consume(
            &dispatcher,
            &publisher(),
            delivery(br#"{"type":"unknown"}"#, rejects_once()),
        )
        .await;
        assert_eq!(settlement, Settlement::Reject);
    }

    #[tokio::test]
    async fn failed_ack_is_only_logged() {
        let mut acker = MockAcknowledger::new();
        acker
            .expect_ack()
            .times(1)
            .returning(|| Err(AmqpError::AckMessageError));
        acker.expect_nack().never();

        let dispatcher = RabbitMQDispatcher::builder("orders")
            .register("created", handler_fn(|_, _| async { Ok(()) }))
            .build();

        let settlement = consume(
            &dispatcher,
            &publisher(),
            delivery(br#"{"type":"created"}"#, acker),
        )
        .await;

        assert_eq!(settlement, Settlement::Ack);
    }

    #[tokio::test]
    async fn poison_message_does_not_stop_the_stream() {
        use futures_util::{stream, StreamExt};

        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = calls.clone();
        let dispatcher = RabbitMQDispatcher::builder("orders")
            .register(
                "created",
                handler_fn(move |msg, _| {
                    let seen = seen.clone();
                    async move {
                        let id = msg.payload["id"].as_u64().unwrap_or_default();
                        seen.lock().unwrap().push(id);
                        if id == 1 {
                            Err(AmqpError::handler("poison"))
                        } else {
                            Ok(())
                        }
                    }
                }),
            )
            .build();

        let deliveries = stream::iter(vec![
            Ok(delivery(br#"{"type":"created","id":1}"#, rejects_once())),
            Ok(delivery(br#"{"type":"created","id":2}"#, acks_once())),
        ])
        .boxed();

        dispatcher.run(deliveries, &publisher()).await;

        assert_eq!(*calls.lock().unwrap(), vec![1, 2]);
    }
}
