//! Registration of a sender, pending a human decision.
//!
//! ```text
//! Idle -> AwaitingDecision -> {Confirmed, Rejected, TimedOut} -> Idle
//! ```
//!
//! Only one registration can await a decision. The slot is a mutex over an
//! optional pending entry owning the one-shot sender, so whichever of
//! confirm, reject or timeout takes the entry first is the only one able to
//! deliver an outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::events::{EventSink, ProtocolEvent};
use crate::session::SessionRegistry;
use lanvault_common::{Error, Result, SessionId};

/// How long a registration waits for a decision.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of `POST /api/v1/register`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub pin: String,
    #[serde(default)]
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    AwaitingDecision,
}

struct PendingRegistration {
    ticket: u64,
    nonce: String,
    created: Instant,
    outcome: oneshot::Sender<Result<SessionId>>,
}

/// Server side of pairing.
pub struct PairingHandler {
    sessions: Arc<SessionRegistry>,
    events: Arc<dyn EventSink>,
    timeout: Duration,
    expected_pin: Mutex<Option<String>>,
    pending: Mutex<Option<PendingRegistration>>,
    next_ticket: AtomicU64,
}

/// Clears this request's slot if the waiting future is dropped.
struct PendingGuard<'a> {
    handler: &'a PairingHandler,
    ticket: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.handler.take_if(self.ticket).is_some() {
            debug!(ticket = self.ticket, "Registration abandoned by sender");
        }
    }
}

impl PairingHandler {
    pub fn new(sessions: Arc<SessionRegistry>, events: Arc<dyn EventSink>) -> Self {
        Self {
            sessions,
            events,
            timeout: REGISTRATION_TIMEOUT,
            expected_pin: Mutex::new(None),
            pending: Mutex::new(None),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Override the decision timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Require registrations to present `pin`. `None` accepts any PIN and
    /// leaves verification to the human.
    pub fn set_pin(&self, pin: Option<String>) {
        *lock(&self.expected_pin) = pin;
    }

    /// Generate a random 6-digit PIN, install it and return it for display.
    pub fn generate_pin(&self) -> String {
        let pin = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32));
        self.set_pin(Some(pin.clone()));
        pin
    }

    pub fn state(&self) -> PairingState {
        if lock(&self.pending).is_some() {
            PairingState::AwaitingDecision
        } else {
            PairingState::Idle
        }
    }

    /// Handle a registration and wait for the decision.
    ///
    /// # Errors
    /// - `InvalidInput` if the PIN or nonce is missing
    /// - `AuthenticationFailure` if a PIN is configured and does not match
    /// - `Busy` if another registration is awaiting a decision
    /// - `Rejected` if the human rejects the request
    /// - `Timeout` if no decision arrives in time
    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        if request.pin.trim().is_empty() || request.nonce.trim().is_empty() {
            return Err(Error::InvalidInput(
                "Missing required parameters: pin and nonce".to_string(),
            ));
        }

        if let Some(expected) = lock(&self.expected_pin).as_deref() {
            if !bool::from(expected.as_bytes().ct_eq(request.pin.as_bytes())) {
                warn!("Registration with wrong PIN refused");
                return Err(Error::AuthenticationFailure);
            }
        }

        let (tx, mut rx) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        {
            let mut slot = lock(&self.pending);
            if slot.is_some() {
                info!("Registration refused, another one is pending");
                return Err(Error::Busy(
                    "Another registration is awaiting confirmation".to_string(),
                ));
            }
            *slot = Some(PendingRegistration {
                ticket,
                nonce: request.nonce.clone(),
                created: Instant::now(),
                outcome: tx,
            });
        }
        let _guard = PendingGuard {
            handler: self,
            ticket,
        };

        info!(ticket, "Registration awaiting confirmation");
        self.events.emit(ProtocolEvent::RegisterRequestReceived {
            nonce: request.nonce,
        });

        let outcome = match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(received) => received,
            Err(_) => {
                if self.take_if(ticket).is_some() {
                    info!(ticket, "Registration timed out");
                    return Err(Error::Timeout("Registration timeout".to_string()));
                }
                // A decision took the slot right at the deadline.
                rx.await
            }
        };

        let session_id = outcome
            .map_err(|_| Error::Conflict("Registration was abandoned".to_string()))??;
        Ok(RegisterResponse { session_id })
    }

    /// Accept the pending registration and mint its session.
    ///
    /// # Errors
    /// - `NotFound` if nothing is pending or the sender stopped waiting
    pub fn confirm(&self) -> Result<SessionId> {
        let pending = lock(&self.pending)
            .take()
            .ok_or_else(|| Error::NotFound("No pending registration to confirm".to_string()))?;

        let session_id = self.sessions.create(&pending.nonce);
        if pending.outcome.send(Ok(session_id.clone())).is_err() {
            self.sessions.remove(&session_id);
            return Err(Error::NotFound(
                "Registration request is no longer waiting".to_string(),
            ));
        }

        info!(
            session = %session_id,
            waited_ms = pending.created.elapsed().as_millis() as u64,
            "Registration confirmed"
        );
        self.events.emit(ProtocolEvent::DeviceRegistered {
            session_id: session_id.clone(),
        });
        Ok(session_id)
    }

    /// Reject the pending registration.
    ///
    /// # Errors
    /// - `NotFound` if nothing is pending
    pub fn reject(&self) -> Result<()> {
        let pending = lock(&self.pending)
            .take()
            .ok_or_else(|| Error::NotFound("No pending registration to reject".to_string()))?;

        if pending
            .outcome
            .send(Err(Error::Rejected(
                "Registration rejected by user".to_string(),
            )))
            .is_err()
        {
            debug!("Rejected registration was no longer waiting");
        }
        info!(ticket = pending.ticket, "Registration rejected");
        Ok(())
    }

    fn take_if(&self, ticket: u64) -> Option<PendingRegistration> {
        let mut slot = lock(&self.pending);
        if slot.as_ref().map(|p| p.ticket) == Some(ticket) {
            slot.take()
        } else {
            None
        }
    }
}

/// The guarded values stay consistent under panic, so poisoning is ignored.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
