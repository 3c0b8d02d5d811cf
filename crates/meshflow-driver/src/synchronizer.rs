/*!
 * Request/response correlation.
 *
 * Commands on the mesh are fire-and-forget; the answer comes back later as
 * an unsolicited cluster command. A [`RequestResponseSynchronizer`] turns the
 * pair into one bounded call for a single device: the caller opens a cycle
 * with the response type it expects, sends, then waits for the matching
 * delivery or a timeout. Only one exchange per device is outstanding at a
 * time; opening a new cycle supersedes the previous one.
 */
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use meshflow_core::types::Eui64;

use crate::cluster::ResponseType;
use crate::error::{DriverError, Result};

/// A response delivered by the inbound path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncResponse {
    /// What arrived
    pub response_type: ResponseType,
    /// Whether the device reported success
    pub success: bool,
    /// Response payload
    pub payload: Bytes,
}

impl AsyncResponse {
    /// Create a response with no payload
    pub fn new(response_type: ResponseType, success: bool) -> Self {
        Self {
            response_type,
            success,
            payload: Bytes::new(),
        }
    }

    /// Set the payload
    pub fn with_payload<P: Into<Bytes>>(mut self, payload: P) -> Self {
        self.payload = payload.into();
        self
    }
}

/// Ticket for one open exchange cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingResponse {
    cycle: u64,
    expected: ResponseType,
}

impl PendingResponse {
    /// The response type being waited for
    pub fn expected(&self) -> ResponseType {
        self.expected
    }
}

#[derive(Debug, Default)]
struct Exchange {
    cycle: u64,
    expected: Option<ResponseType>,
    delivered: Option<AsyncResponse>,
}

/// Correlates commands with their responses for one device
#[derive(Debug)]
pub struct RequestResponseSynchronizer {
    eui64: Eui64,
    state: Mutex<Exchange>,
    signal: Notify,
}

impl RequestResponseSynchronizer {
    /// Create a synchronizer for a device
    pub fn new(eui64: Eui64) -> Self {
        Self {
            eui64,
            state: Mutex::new(Exchange::default()),
            signal: Notify::new(),
        }
    }

    /// The device this synchronizer belongs to
    pub fn eui64(&self) -> Eui64 {
        self.eui64
    }

    fn state(&self) -> MutexGuard<'_, Exchange> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Open a new exchange cycle expecting `expected`
    ///
    /// Any previous delivery is discarded. Call this before sending so a
    /// response that arrives ahead of the waiter is not lost.
    pub fn begin(&self, expected: ResponseType) -> PendingResponse {
        let mut state = self.state();
        state.cycle = state.cycle.wrapping_add(1);
        state.expected = Some(expected);
        state.delivered = None;
        trace!("{}: opened cycle {} expecting {}", self.eui64, state.cycle, expected);
        PendingResponse {
            cycle: state.cycle,
            expected,
        }
    }

    /// Deliver a response; returns `false` when nothing is waiting for one
    pub fn deliver(&self, response: AsyncResponse) -> bool {
        {
            let mut state = self.state();
            if state.expected.is_none() {
                debug!(
                    "{}: dropping {} with no outstanding request",
                    self.eui64, response.response_type
                );
                return false;
            }
            state.delivered = Some(response);
        }
        self.signal.notify_waiters();
        true
    }

    /// Close a cycle without waiting for it
    pub fn abandon(&self, pending: PendingResponse) {
        let mut state = self.state();
        if state.cycle == pending.cycle {
            state.expected = None;
            state.delivered = None;
        }
    }

    fn take_delivery(&self, pending: &PendingResponse) -> Option<Result<AsyncResponse>> {
        let mut state = self.state();
        if state.cycle != pending.cycle {
            return Some(Err(DriverError::invalid_state(format!(
                "exchange with {} was superseded",
                self.eui64
            ))));
        }

        let response = state.delivered.take()?;
        state.expected = None;

        if response.response_type != pending.expected {
            return Some(Err(DriverError::UnexpectedResponse {
                eui64: self.eui64,
                expected: pending.expected,
                received: response.response_type,
            }));
        }
        Some(Ok(response))
    }

    /// Wait for the response of an open cycle
    ///
    /// On timeout the cycle is closed so a late delivery is dropped and the
    /// next cycle starts clean.
    pub async fn wait(&self, pending: PendingResponse, timeout: Duration) -> Result<AsyncResponse> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.take_delivery(&pending) {
                return outcome;
            }

            if time::timeout_at(deadline, notified).await.is_err() {
                self.abandon(pending);
                debug!("{}: timed out waiting for {}", self.eui64, pending.expected);
                return Err(DriverError::ResponseTimeout {
                    eui64: self.eui64,
                    timeout,
                });
            }
        }
    }

    /// Open a cycle, run `send`, then wait for the response
    ///
    /// A failed send closes the cycle and is returned as is. A response that
    /// reports failure is returned as [`DriverError::CommandRejected`].
    pub async fn exchange<F>(
        &self,
        expected: ResponseType,
        timeout: Duration,
        send: F,
    ) -> Result<AsyncResponse>
    where
        F: Future<Output = Result<()>>,
    {
        let pending = self.begin(expected);

        if let Err(e) = send.await {
            self.abandon(pending);
            return Err(e);
        }

        let response = self.wait(pending, timeout).await?;
        if !response.success {
            return Err(DriverError::CommandRejected {
                eui64: self.eui64,
                response: response.response_type,
            });
        }
        Ok(response)
    }
}

/// One synchronizer per device, created on first use
#[derive(Debug, Default)]
pub struct SynchronizerRegistry {
    synchronizers: Mutex<HashMap<Eui64, Arc<RequestResponseSynchronizer>>>,
}

impl SynchronizerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn synchronizers(&self) -> MutexGuard<'_, HashMap<Eui64, Arc<RequestResponseSynchronizer>>> {
        match self.synchronizers.lock() {
            Ok(synchronizers) => synchronizers,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Get the device's synchronizer, creating it if needed
    pub fn get_or_create(&self, eui64: Eui64) -> Arc<RequestResponseSynchronizer> {
        self.synchronizers()
            .entry(eui64)
            .or_insert_with(|| Arc::new(RequestResponseSynchronizer::new(eui64)))
            .clone()
    }

    /// Get the device's synchronizer without creating it
    pub fn get(&self, eui64: Eui64) -> Option<Arc<RequestResponseSynchronizer>> {
        self.synchronizers().get(&eui64).cloned()
    }

    /// Deliver a response to the device's synchronizer
    ///
    /// Returns `false` when the device has no synchronizer or nothing is
    /// waiting; either way the response is dropped.
    pub fn deliver(&self, eui64: Eui64, response: AsyncResponse) -> bool {
        match self.get(eui64) {
            Some(synchronizer) => synchronizer.deliver(response),
            None => {
                debug!(
                    "{}: unsolicited {} dropped",
                    eui64, response.response_type
                );
                false
            }
        }
    }

    /// Forget a device's synchronizer
    pub fn remove(&self, eui64: Eui64) -> bool {
        self.synchronizers().remove(&eui64).is_some()
    }

    /// Forget every synchronizer
    pub fn clear(&self) {
        self.synchronizers().clear();
    }

    /// Number of live synchronizers
    pub fn len(&self) -> usize {
        self.synchronizers().len()
    }

    /// Whether there are no live synchronizers
    pub fn is_empty(&self) -> bool {
        self.synchronizers().is_empty()
    }
}
