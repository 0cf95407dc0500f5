// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Forwarding Loop
//!
//! The task started by `Queue::subscribe`. It moves each delivered message onto the
//! caller's output channel, one at a time and in broker order. The send waits for
//! room in the output, so a slow reader holds back the broker once the prefetch limit
//! is reached.
//!
//! The loop ends in exactly one [`Termination`]:
//! - `Disconnected`: the broker stream ended on its own; the disconnect callback runs once.
//! - `Cancelled`: the stream ended after `Queue::close` cancelled the consumer.
//! - `OutputClosed`: the reader went away; the undelivered message is requeued.

use crate::{exchange::DisconnectCallback, message::Message, queue::Termination};
use futures_util::{Stream, StreamExt};
use std::{
    pin::pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

pub(crate) struct Forwarder {
    pub(crate) queue: String,
    pub(crate) cancelled: Arc<AtomicBool>,
    pub(crate) on_disconnect: DisconnectCallback,
    pub(crate) state: watch::Sender<Option<Termination>>,
}

pub(crate) async fn forward<S>(fwd: Forwarder, deliveries: S, output: mpsc::Sender<Message>)
where
    S: Stream<Item = Result<Message, lapin::Error>>,
{
    let queue = fwd.queue.as_str();
    let mut deliveries = pin!(deliveries);

    debug!(queue, "consumer started");

    let termination = loop {
        match deliveries.next().await {
            Some(Ok(msg)) => {
                debug!(queue, tag = msg.delivery_tag(), "received");

                if let Err(mpsc::error::SendError(msg)) = output.send(msg).await {
                    warn!(queue, "output channel closed, requeuing delivery");
                    if let Err(err) = msg.nack(true).await {
                        error!(error = err.to_string(), queue, "error whiling requeuing");
                    }
                    break Termination::OutputClosed;
                }
            }
            Some(Err(err)) => error!(error = err.to_string(), queue, "errors consume msg"),
            None if fwd.cancelled.load(Ordering::SeqCst) => {
                debug!(queue, "consumer cancelled");
                break Termination::Cancelled;
            }
            None => {
                warn!(queue, "delivery stream closed");
                (fwd.on_disconnect.as_ref())();
                break Termination::Disconnected;
            }
        }
    };

    drop(output);
    fwd.state.send_replace(Some(termination));
}
