// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module dials the broker and opens the single channel an `Exchange` works
//! through. Nothing is handed back unless both steps succeed.

use crate::{config::DEFAULT_URL, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use tracing::{debug, error};

/// Reply code sent with a normal channel or connection close.
pub const REPLY_SUCCESS: u16 = 200;

/// Connects to the broker at `uri` and opens one channel on that connection.
///
/// An empty `uri` falls back to [`DEFAULT_URL`]. When `connection_name` is given it is
/// sent to the broker as the client connection name.
///
/// # Returns
/// * `Result<(Connection, Channel), AmqpError>` - the connection and its channel, or the
///   failing step as `ConnectionError` / `ChannelError`.
///
/// # Example
/// ```no_run
/// # async fn run() -> Result<(), hutch::errors::AmqpError> {
/// let (conn, channel) = hutch::channel::new_amqp_channel("", None).await?;
/// # Ok(())
/// # }
/// ```
pub async fn new_amqp_channel(
    uri: &str,
    connection_name: Option<&str>,
) -> Result<(Connection, Channel), AmqpError> {
    let uri = if uri.is_empty() { DEFAULT_URL } else { uri };

    let mut options = ConnectionProperties::default();
    if let Some(name) = connection_name {
        options = options.with_connection_name(LongString::from(name.to_owned()));
    }

    debug!("creating amqp connection...");
    let conn = match Connection::connect(uri, options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(err.into()))
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!(channel = c.id(), "channel created");
            Ok((conn, c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            if let Err(close_err) = conn.close(REPLY_SUCCESS, "channel open failed").await {
                debug!(error = close_err.to_string(), "failure to close connection");
            }
            Err(AmqpError::ChannelError(err.into()))
        }
    }
}
