// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management
//!
//! An `Exchange` owns one broker connection and the single channel opened over it,
//! declares a named exchange on that channel and is the entry point for publishing
//! (see the `publisher` module). Channel and connection live and die together:
//! [`Exchange::close`] tears down both.
//!
//! Queues declared against an exchange share its channel, so the prefetch (QoS)
//! setting of the channel is tracked here and conflicting requests are refused.

use crate::{
    channel::{new_amqp_channel, REPLY_SUCCESS},
    config::AmqpConfigs,
    errors::{AmqpError, BrokerError},
    topology,
};
use lapin::{options::BasicQosOptions, Channel, Connection};
use serde::Deserialize;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Callback invoked when a subscription loses its broker delivery stream.
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Default disconnect callback: logs and halts the process.
pub fn default_on_disconnect() -> DisconnectCallback {
    Arc::new(|| {
        error!("lost connection to the broker");
        std::process::exit(1);
    })
}

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - Custom: Any plugin-provided exchange type
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
    Custom(String),
}

impl From<&str> for ExchangeKind {
    fn from(kind: &str) -> Self {
        match kind {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "topic" => ExchangeKind::Topic,
            "headers" => ExchangeKind::Headers,
            other => ExchangeKind::Custom(other.to_owned()),
        }
    }
}

impl From<String> for ExchangeKind {
    fn from(kind: String) -> Self {
        ExchangeKind::from(kind.as_str())
    }
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Custom(kind) => lapin::ExchangeKind::Custom(kind.clone()),
        }
    }
}

/// Options used when building a new [`Exchange`].
///
/// The defaults declare a durable, non auto-delete `topic` exchange named `hutch`
/// and halt the process on disconnect.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) propagate_trace_context: bool,
    #[serde(skip)]
    pub(crate) on_disconnect: Option<DisconnectCallback>,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        ExchangeOptions {
            name: "hutch".to_owned(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
            propagate_trace_context: false,
            on_disconnect: None,
        }
    }
}

impl fmt::Debug for ExchangeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeOptions")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("durable", &self.durable)
            .field("auto_delete", &self.auto_delete)
            .field("propagate_trace_context", &self.propagate_trace_context)
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}

impl ExchangeOptions {
    /// Creates options for the exchange `name` with the remaining defaults.
    pub fn new(name: &str) -> ExchangeOptions {
        ExchangeOptions {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Durable exchanges survive broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Auto-delete exchanges are removed once the last binding is gone.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Injects the current OpenTelemetry context into the headers of published messages.
    pub fn propagate_trace_context(mut self, propagate: bool) -> Self {
        self.propagate_trace_context = propagate;
        self
    }

    /// Sets the callback invoked when a subscription loses its delivery stream.
    pub fn on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(callback));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Prefetch limits applied to a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Prefetch {
    pub count: u16,
    pub size: u32,
}

impl Prefetch {
    pub fn is_set(&self) -> bool {
        self.count > 0 || self.size > 0
    }
}

impl fmt::Display for Prefetch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "count={} size={}", self.count, self.size)
    }
}

/// An amqp exchange wrapping one connection and one channel.
pub struct Exchange {
    name: String,
    connection: Connection,
    channel: Channel,
    on_disconnect: DisconnectCallback,
    pub(crate) propagate_trace_context: bool,
    closed: AtomicBool,
    qos: Mutex<Option<Prefetch>>,
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("name", &self.name)
            .field("channel", &self.channel.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Exchange {
    /// Connects to the broker, opens a channel and declares the exchange.
    ///
    /// An empty `url` connects to `amqp://localhost`; `None` options use
    /// [`ExchangeOptions::default`]. Nothing is returned unless every step succeeds.
    pub async fn new(
        url: &str,
        options: Option<ExchangeOptions>,
    ) -> Result<Arc<Exchange>, AmqpError> {
        Self::connect(url, None, options.unwrap_or_default()).await
    }

    /// Same as [`Exchange::new`], with the connection settings taken from `cfg`.
    pub async fn from_configs(
        cfg: &AmqpConfigs,
        options: Option<ExchangeOptions>,
    ) -> Result<Arc<Exchange>, AmqpError> {
        Self::connect(
            &cfg.uri()?,
            Some(&cfg.connection_name),
            options.unwrap_or_default(),
        )
        .await
    }

    async fn connect(
        url: &str,
        connection_name: Option<&str>,
        options: ExchangeOptions,
    ) -> Result<Arc<Exchange>, AmqpError> {
        let (connection, channel) = new_amqp_channel(url, connection_name).await?;

        if let Err(err) = topology::declare_exchange(&channel, &options).await {
            if let Err(close_err) = connection.close(REPLY_SUCCESS, "declare failed").await {
                debug!(error = close_err.to_string(), "failure to close connection");
            }
            return Err(err);
        }

        Ok(Arc::new(Exchange {
            name: options.name,
            connection,
            channel,
            on_disconnect: options.on_disconnect.unwrap_or_else(default_on_disconnect),
            propagate_trace_context: options.propagate_trace_context,
            closed: AtomicBool::new(false),
            qos: Mutex::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether [`Exchange::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the channel if it is still usable.
    pub(crate) fn channel(&self) -> Result<&Channel, AmqpError> {
        if self.is_closed() || !self.channel.status().connected() {
            return Err(AmqpError::ChannelUnavailable);
        }

        Ok(&self.channel)
    }

    pub(crate) fn disconnect_callback(&self) -> DisconnectCallback {
        self.on_disconnect.clone()
    }

    /// Applies `requested` to the shared channel.
    ///
    /// A channel carries one prefetch setting: asking for the one already applied is a
    /// no-op, asking for a different one fails with `QoSConflict`.
    pub(crate) async fn apply_qos(
        &self,
        queue: &str,
        requested: Prefetch,
    ) -> Result<(), AmqpError> {
        let mut current = self.qos.lock().await;

        match *current {
            Some(applied) if applied == requested => {
                debug!(queue, prefetch = %requested, "qos already applied");
                return Ok(());
            }
            Some(applied) => {
                error!(queue, current = %applied, requested = %requested, "conflicting qos");
                return Err(AmqpError::QoSConflict {
                    current: applied,
                    requested,
                });
            }
            None => {}
        }

        if requested.size > 0 {
            warn!(
                queue,
                size = requested.size,
                "prefetch size is not supported by the broker and is ignored"
            );
        }

        match self
            .channel()?
            .basic_qos(requested.count, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "failure to configure qos");
                Err(AmqpError::QoSDeclarationError(queue.to_owned(), err.into()))
            }
            _ => {
                debug!(queue, prefetch = %requested, "qos configured");
                *current = Some(requested);
                Ok(())
            }
        }
    }

    /// Closes the channel, then the connection.
    ///
    /// Both closes are attempted even when the first fails; the failures are reported
    /// together in `CloseError`. Only the first call closes anything, later calls
    /// return `Ok(())`.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(exchange = self.name.as_str(), "exchange already closed");
            return Ok(());
        }

        debug!(exchange = self.name.as_str(), "closing exchange...");

        let channel = match self.channel.close(REPLY_SUCCESS, "closing").await {
            Err(err) => {
                error!(error = err.to_string(), "failure to close the channel");
                Some(BrokerError::from(err))
            }
            _ => None,
        };

        let connection = match self.connection.close(REPLY_SUCCESS, "closing").await {
            Err(err) => {
                error!(error = err.to_string(), "failure to close the connection");
                Some(BrokerError::from(err))
            }
            _ => None,
        };

        if channel.is_none() && connection.is_none() {
            debug!(exchange = self.name.as_str(), "exchange closed");
            return Ok(());
        }

        Err(AmqpError::CloseError {
            exchange: self.name.clone(),
            channel,
            connection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_declare_durable_topic_hutch() {
        let options = ExchangeOptions::default();

        assert_eq!(options.name(), "hutch");
        assert_eq!(options.kind, ExchangeKind::Topic);
        assert!(options.durable);
        assert!(!options.auto_delete);
        assert!(!options.propagate_trace_context);
        assert!(options.on_disconnect.is_none());
    }

    #[test]
    fn builder_overrides_defaults() {
        let options = ExchangeOptions::new("events")
            .kind(ExchangeKind::Fanout)
            .durable(false)
            .auto_delete(true)
            .on_disconnect(|| {});

        assert_eq!(options.name(), "events");
        assert_eq!(options.kind, ExchangeKind::Fanout);
        assert!(!options.durable);
        assert!(options.auto_delete);
        assert!(options.on_disconnect.is_some());
    }

    #[test]
    fn kind_parses_known_and_custom_names() {
        assert_eq!(ExchangeKind::from("direct"), ExchangeKind::Direct);
        assert_eq!(ExchangeKind::from("headers"), ExchangeKind::Headers);
        assert_eq!(
            ExchangeKind::from("x-delayed-message"),
            ExchangeKind::Custom("x-delayed-message".to_owned())
        );
        assert!(matches!(
            lapin::ExchangeKind::from(&ExchangeKind::Custom("x-custom".to_owned())),
            lapin::ExchangeKind::Custom(kind) if kind == "x-custom"
        ));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: ExchangeOptions =
            serde_json::from_str(r#"{"name":"orders","kind":"direct"}"#).unwrap();

        assert_eq!(options.name(), "orders");
        assert_eq!(options.kind, ExchangeKind::Direct);
        assert!(options.durable);
    }

    #[test]
    fn prefetch_is_set_when_any_limit_positive() {
        assert!(!Prefetch::default().is_set());
        assert!(Prefetch { count: 10, size: 0 }.is_set());
        assert!(Prefetch { count: 0, size: 1024 }.is_set());
        assert_eq!(Prefetch { count: 10, size: 0 }.to_string(), "count=10 size=0");
    }
}
