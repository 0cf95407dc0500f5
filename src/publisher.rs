// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publishing
//!
//! Publishing into an [`Exchange`]. Every message goes out as `application/json` with
//! priority 0 and a single `request_id` header (plus the trace context headers when the
//! exchange was built with `propagate_trace_context`).

use crate::{
    errors::AmqpError,
    exchange::Exchange,
    message::REQUEST_ID_HEADER,
    otel,
};
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::error;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Whether the broker keeps a message across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient = 1,
    Persistent = 2,
}

impl Exchange {
    /// Publishes a persistent message.
    pub async fn publish(
        &self,
        routing_key: &str,
        message: &[u8],
        request_id: &str,
    ) -> Result<(), AmqpError> {
        self.publish_with_mode(routing_key, message, request_id, DeliveryMode::Persistent)
            .await
    }

    /// Publishes a transient message, which may be lost if the broker restarts.
    pub async fn publish_transient(
        &self,
        routing_key: &str,
        message: &[u8],
        request_id: &str,
    ) -> Result<(), AmqpError> {
        self.publish_with_mode(routing_key, message, request_id, DeliveryMode::Transient)
            .await
    }

    /// Serializes `payload` as JSON and publishes it persistently.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        routing_key: &str,
        payload: &T,
        request_id: &str,
    ) -> Result<(), AmqpError> {
        let body = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::ParsePayloadError
        })?;

        self.publish(routing_key, &body, request_id).await
    }

    pub async fn publish_with_mode(
        &self,
        routing_key: &str,
        message: &[u8],
        request_id: &str,
        mode: DeliveryMode,
    ) -> Result<(), AmqpError> {
        let channel = self.channel().inspect_err(|_| {
            error!(exchange = self.name(), "channel is nil");
        })?;

        let ctx = self.propagate_trace_context.then(Context::current);

        match channel
            .basic_publish(
                self.name(),
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                message,
                properties(request_id, mode, ctx.as_ref()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.into()))
            }
            _ => Ok(()),
        }
    }
}

fn properties(request_id: &str, mode: DeliveryMode, ctx: Option<&Context>) -> BasicProperties {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

    if let Some(ctx) = ctx {
        otel::inject(ctx, &mut headers);
    }

    headers.insert(
        ShortString::from(REQUEST_ID_HEADER),
        AMQPValue::LongString(LongString::from(request_id)),
    );

    BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_delivery_mode(mode as u8)
        .with_priority(0)
        .with_headers(FieldTable::from(headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistent_properties_match_wire_shape() {
        let props = properties("req-1", DeliveryMode::Persistent, None);

        assert_eq!(
            props.content_type().as_ref().map(|c| c.as_str()),
            Some(JSON_CONTENT_TYPE)
        );
        assert_eq!(*props.delivery_mode(), Some(2));
        assert_eq!(*props.priority(), Some(0));

        let headers = props.headers().as_ref().unwrap().inner();
        assert_eq!(headers.len(), 1);
        assert_eq!(
            headers.get(&ShortString::from(REQUEST_ID_HEADER)),
            Some(&AMQPValue::LongString(LongString::from("req-1")))
        );
    }

    #[test]
    fn transient_properties_use_mode_one() {
        let props = properties("req-2", DeliveryMode::Transient, None);
        assert_eq!(*props.delivery_mode(), Some(1));
    }

    #[test]
    fn empty_context_adds_no_trace_headers() {
        let props = properties("req-3", DeliveryMode::Persistent, Some(&Context::new()));
        assert_eq!(props.headers().as_ref().unwrap().inner().len(), 1);
    }
}
