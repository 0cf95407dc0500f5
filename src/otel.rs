// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Header Propagation
//!
//! Injects the caller's trace context into outgoing message headers and extracts it
//! from delivered ones, so a consumer span can continue the producer's trace.

use lapin::types::{AMQPValue, FieldTable, ShortString};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    trace::{SpanKind, TraceContextExt, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::debug;

pub(crate) const TRACER_NAME: &str = "hutch";

/// Writes trace context entries into the headers of an outgoing message.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl Injector for HeaderInjector<'_> {
    /// Stores one propagation field as a long string header.
    ///
    /// # Parameters
    /// * `key` - The propagation field name, stored lowercased
    /// * `value` - The encoded field value
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            ShortString::from(key.to_ascii_lowercase()),
            AMQPValue::LongString(value.into()),
        );
    }
}

/// Reads trace context entries from the headers of a delivered message.
///
/// Borrows the delivery headers as they are; nothing is copied per delivery.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl Extractor for HeaderExtractor<'_> {
    /// Looks up one propagation field.
    ///
    /// # Parameters
    /// * `key` - The propagation field name
    ///
    /// # Returns
    /// The value of a string header (long or short), or `None` when the header is
    /// missing, of another type, or not valid UTF-8
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key)? {
            AMQPValue::LongString(value) => match std::str::from_utf8(value.as_bytes()) {
                Ok(value) => Some(value),
                Err(err) => {
                    debug!(key, error = err.to_string(), "skipping non utf-8 trace header");
                    None
                }
            },
            AMQPValue::ShortString(value) => Some(value.as_str()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(ShortString::as_str).collect()
    }
}

/// Writes `ctx` into `headers` with the globally registered propagator.
///
/// # Parameters
/// * `ctx` - The context to propagate, usually `Context::current()`
/// * `headers` - The headers of the message being published
pub(crate) fn inject(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector { headers })
    });
}

/// Extracts the producer context from `headers` and starts a consumer span under it.
///
/// # Parameters
/// * `headers` - The delivery headers, if any
/// * `name` - The span name, the queue the delivery came from
///
/// # Returns
/// A context owning the consumer span; the span ends when the context is dropped
pub(crate) fn consumer_context(headers: Option<&FieldTable>, name: &str) -> Context {
    let empty = BTreeMap::new();
    let headers = headers.map(FieldTable::inner).unwrap_or(&empty);

    let parent = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor { headers })
    });

    let tracer = global::tracer(TRACER_NAME);
    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(&tracer, &parent);

    parent.with_span(span)
}
