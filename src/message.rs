// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivered Messages and Acknowledgement
//!
//! A [`Message`] is an immutable delivered payload bundled with the [`Acknowledger`]
//! that accepts or rejects it. Messages coming from the broker carry a
//! [`DeliveryAcknowledger`] bound to their delivery tag; tests can build messages
//! around a [`NullAcknowledger`](crate::null_acknowledger::NullAcknowledger) instead.

use crate::errors::AmqpError;
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    types::AMQPValue,
};
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{collections::BTreeMap, fmt, sync::Arc};
use tracing::error;

/// Header carrying the caller supplied request id.
pub const REQUEST_ID_HEADER: &str = "request_id";

/// Accept/reject authority for a single delivered message.
///
/// At most one of `ack` / `nack` succeeds per delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Confirms the message was processed; the broker removes it.
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Rejects the message; with `requeue` the broker delivers it again, otherwise it is dropped.
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl<T: Acknowledger + ?Sized> Acknowledger for Box<T> {
    async fn ack(&self) -> Result<(), AmqpError> {
        (**self).ack().await
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        (**self).nack(requeue).await
    }
}

#[async_trait]
impl<T: Acknowledger + ?Sized> Acknowledger for Arc<T> {
    async fn ack(&self) -> Result<(), AmqpError> {
        (**self).ack().await
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        (**self).nack(requeue).await
    }
}

/// Acknowledges one broker delivery, never its predecessors (no multiple flag).
#[derive(Debug, Clone)]
pub struct DeliveryAcknowledger {
    acker: Acker,
    delivery_tag: u64,
}

impl DeliveryAcknowledger {
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }
}

#[async_trait]
impl Acknowledger for DeliveryAcknowledger {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), tag = self.delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError(err.into())
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), tag = self.delivery_tag, "error whiling nack msg");
                AmqpError::NackMessageError(err.into())
            })
    }
}

/// A delivered amqp message.
pub struct Message {
    acknowledger: Box<dyn Acknowledger>,
    headers: BTreeMap<String, AMQPValue>,
    body: Vec<u8>,
    routing_key: String,
    delivery_tag: u64,
    redelivered: bool,
    context: Context,
}

impl Message {
    /// Builds a message around any acknowledger.
    pub fn new<A>(acknowledger: A, headers: BTreeMap<String, AMQPValue>, body: Vec<u8>) -> Message
    where
        A: Acknowledger + 'static,
    {
        Message {
            acknowledger: Box::new(acknowledger),
            headers,
            body,
            routing_key: String::new(),
            delivery_tag: 0,
            redelivered: false,
            context: Context::new(),
        }
    }

    pub(crate) fn from_delivery(delivery: Delivery, context: Context) -> Message {
        let headers = delivery
            .properties
            .headers()
            .as_ref()
            .map(|table| {
                table
                    .inner()
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Message {
            acknowledger: Box::new(DeliveryAcknowledger {
                acker: delivery.acker,
                delivery_tag: delivery.delivery_tag,
            }),
            headers,
            body: delivery.data,
            routing_key: delivery.routing_key.to_string(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            context,
        }
    }

    pub fn headers(&self) -> &BTreeMap<String, AMQPValue> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&AMQPValue> {
        self.headers.get(key)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The `request_id` header, when present as a string.
    pub fn request_id(&self) -> Option<String> {
        match self.header(REQUEST_ID_HEADER)? {
            AMQPValue::LongString(value) => {
                Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
            }
            AMQPValue::ShortString(value) => Some(value.to_string()),
            _ => None,
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Trace context of the delivery, carrying the consumer span.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Decodes the JSON body.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.body).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError
        })
    }

    pub fn acknowledger(&self) -> &dyn Acknowledger {
        self.acknowledger.as_ref()
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acknowledger.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acknowledger.nack(requeue).await
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("headers", &self.headers)
            .field("body", &String::from_utf8_lossy(&self.body))
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{BrokerError, BrokerErrorKind};
    use lapin::types::{LongString, ShortString};
    use serde::Deserialize;

    fn headers(request_id: AMQPValue) -> BTreeMap<String, AMQPValue> {
        BTreeMap::from([(REQUEST_ID_HEADER.to_owned(), request_id)])
    }

    #[tokio::test]
    async fn ack_is_forwarded_to_the_acknowledger() {
        let mut acknowledger = MockAcknowledger::new();
        acknowledger.expect_ack().times(1).returning(|| Ok(()));
        acknowledger.expect_nack().never();

        let msg = Message::new(acknowledger, BTreeMap::new(), b"0".to_vec());

        assert_eq!(msg.ack().await, Ok(()));
    }

    #[tokio::test]
    async fn nack_forwards_requeue_flag_and_error() {
        let mut acknowledger = MockAcknowledger::new();
        acknowledger
            .expect_nack()
            .withf(|requeue| *requeue)
            .times(1)
            .returning(|_| {
                Err(AmqpError::NackMessageError(BrokerError::new(
                    BrokerErrorKind::Closed,
                    "channel closed",
                )))
            });

        let msg = Message::new(acknowledger, BTreeMap::new(), vec![]);
        let err = msg.nack(true).await.unwrap_err();

        assert_eq!(err.kind(), Some(BrokerErrorKind::Closed));
    }

    #[test]
    fn request_id_reads_string_headers() {
        let long = Message::new(
            MockAcknowledger::new(),
            headers(AMQPValue::LongString(LongString::from("abc"))),
            vec![],
        );
        assert_eq!(long.request_id().as_deref(), Some("abc"));

        let short = Message::new(
            MockAcknowledger::new(),
            headers(AMQPValue::ShortString(ShortString::from("def"))),
            vec![],
        );
        assert_eq!(short.request_id().as_deref(), Some("def"));

        let other = Message::new(
            MockAcknowledger::new(),
            headers(AMQPValue::Boolean(true)),
            vec![],
        );
        assert_eq!(other.request_id(), None);
    }

    #[test]
    fn parse_json_decodes_body() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Greeting {
            hello: String,
        }

        let msg = Message::new(
            MockAcknowledger::new(),
            BTreeMap::new(),
            br#"{"hello":"world"}"#.to_vec(),
        );
        assert_eq!(
            msg.parse_json::<Greeting>(),
            Ok(Greeting {
                hello: "world".to_owned()
            })
        );

        let bad = Message::new(MockAcknowledger::new(), BTreeMap::new(), b"nope".to_vec());
        assert_eq!(
            bad.parse_json::<Greeting>(),
            Err(AmqpError::ParsePayloadError)
        );
    }
}
