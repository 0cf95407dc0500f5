// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory [`Acknowledger`] that records the decision instead of talking to a broker.

use crate::{errors::AmqpError, message::Acknowledger};
use async_trait::async_trait;
use std::{fmt, sync::Mutex};

/// The acknowledgement decision recorded by a [`NullAcknowledger`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Acknowledgement {
    #[default]
    Unacknowledged,
    Acked,
    Requeued,
    Dropped,
}

impl fmt::Display for Acknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Acknowledgement::Unacknowledged => "unacknowledged",
            Acknowledgement::Acked => "acked",
            Acknowledgement::Requeued => "requeued",
            Acknowledgement::Dropped => "dropped",
        };

        f.write_str(s)
    }
}

/// Records the first ack/nack; any later call fails with `AlreadyAcknowledged`.
#[derive(Debug, Default)]
pub struct NullAcknowledger {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    acked: bool,
    acknowledgement: Acknowledgement,
}

impl NullAcknowledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acknowledgement(&self) -> Acknowledgement {
        self.lock().acknowledgement
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // the state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, acknowledgement: Acknowledgement) -> Result<(), AmqpError> {
        let mut state = self.lock();
        if state.acked {
            return Err(AmqpError::AlreadyAcknowledged);
        }

        state.acked = true;
        state.acknowledgement = acknowledgement;
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for NullAcknowledger {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.record(Acknowledgement::Acked)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        if requeue {
            self.record(Acknowledgement::Requeued)
        } else {
            self.record(Acknowledgement::Dropped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::{collections::BTreeMap, sync::Arc};

    #[test]
    fn starts_unacknowledged() {
        let acknowledger = NullAcknowledger::new();
        assert_eq!(acknowledger.acknowledgement(), Acknowledgement::Unacknowledged);
        assert_eq!(acknowledger.acknowledgement().to_string(), "unacknowledged");
    }

    #[tokio::test]
    async fn ack_records_acked_once() {
        let acknowledger = NullAcknowledger::new();

        assert_eq!(acknowledger.ack().await, Ok(()));
        assert_eq!(acknowledger.acknowledgement(), Acknowledgement::Acked);

        assert_eq!(acknowledger.ack().await, Err(AmqpError::AlreadyAcknowledged));
        assert_eq!(
            acknowledger.nack(true).await,
            Err(AmqpError::AlreadyAcknowledged)
        );
        assert_eq!(acknowledger.acknowledgement(), Acknowledgement::Acked);
    }

    #[tokio::test]
    async fn nack_records_requeue_or_drop() {
        let requeued = NullAcknowledger::new();
        assert_eq!(requeued.nack(true).await, Ok(()));
        assert_eq!(requeued.acknowledgement(), Acknowledgement::Requeued);

        let dropped = NullAcknowledger::new();
        assert_eq!(dropped.nack(false).await, Ok(()));
        assert_eq!(dropped.acknowledgement(), Acknowledgement::Dropped);

        assert_eq!(dropped.ack().await, Err(AmqpError::AlreadyAcknowledged));
        assert_eq!(dropped.acknowledgement(), Acknowledgement::Dropped);
        assert_eq!(dropped.acknowledgement().to_string(), "dropped");
    }

    #[tokio::test]
    async fn decision_is_observable_through_a_message() {
        let acknowledger = Arc::new(NullAcknowledger::new());
        let msg = Message::new(acknowledger.clone(), BTreeMap::new(), b"1".to_vec());

        msg.nack(false).await.unwrap();

        assert_eq!(acknowledger.acknowledgement(), Acknowledgement::Dropped);
        assert_eq!(msg.ack().await, Err(AmqpError::AlreadyAcknowledged));
    }
}
