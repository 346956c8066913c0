//! Call lifecycle state machine
//!
//! The coordinator is a plain synchronous state machine. Every input takes the
//! current instant explicitly and returns [`CallEffects`]: the status updates
//! to transmit and the actuations to hand to the platform, in order. The
//! engine owns the only instance and feeds it from a single queue, so remote
//! commands and local signals can never interleave inside one transition.
//!
//! ```text
//!           CALL / outgoing            offhook
//!   Idle ─────────────────────► Dialing ─────────┐
//!     │      ringing(number)                     ▼
//!     └───────────────────────► Ringing ──────► Active
//!                                  │               │
//!      END_CALL / idle / failure   ▼               ▼
//!                               Ended ──────────► Idle
//! ```

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Call, CallDirection, CallId, CallState, CallStatus, CallStatusUpdate};
use crate::device::{AudioRef, TelephonySignal};

/// A request for the platform actuator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actuation {
    PlaceCall { call_id: CallId, number: String },
    Answer { call_id: CallId },
    HangUp { call_id: CallId },
    SendTone { call_id: CallId, digit: char },
    PlayAudio { call_id: CallId, audio: AudioRef },
}

/// Actuation kind, used when reporting failures back to the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuationKind {
    PlaceCall,
    Answer,
    HangUp,
    SendTone,
    PlayAudio,
}

impl ActuationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActuationKind::PlaceCall => "place_call",
            ActuationKind::Answer => "answer",
            ActuationKind::HangUp => "hang_up",
            ActuationKind::SendTone => "send_tone",
            ActuationKind::PlayAudio => "play_audio",
        }
    }
}

impl Actuation {
    pub fn kind(&self) -> ActuationKind {
        match self {
            Actuation::PlaceCall { .. } => ActuationKind::PlaceCall,
            Actuation::Answer { .. } => ActuationKind::Answer,
            Actuation::HangUp { .. } => ActuationKind::HangUp,
            Actuation::SendTone { .. } => ActuationKind::SendTone,
            Actuation::PlayAudio { .. } => ActuationKind::PlayAudio,
        }
    }

    pub fn call_id(&self) -> &CallId {
        match self {
            Actuation::PlaceCall { call_id, .. }
            | Actuation::Answer { call_id }
            | Actuation::HangUp { call_id }
            | Actuation::SendTone { call_id, .. }
            | Actuation::PlayAudio { call_id, .. } => call_id,
        }
    }
}

/// Ordered side effects of one coordinator input
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallEffects {
    pub updates: Vec<CallStatusUpdate>,
    pub actuations: Vec<Actuation>,
}

impl CallEffects {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.actuations.is_empty()
    }

    pub fn extend(&mut self, other: CallEffects) {
        self.updates.extend(other.updates);
        self.actuations.extend(other.actuations);
    }
}

/// Owner of the current call
#[derive(Debug, Default)]
pub struct CallStateCoordinator {
    current: Option<Call>,
    calls_started: u64,
    calls_ended: u64,
}

impl CallStateCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Call> {
        self.current.as_ref()
    }

    pub fn state(&self) -> CallState {
        self.current.as_ref().map(|call| call.state).unwrap_or(CallState::Idle)
    }

    /// Current call if it is connected
    pub fn active_call(&self) -> Option<&Call> {
        self.current.as_ref().filter(|call| call.state == CallState::Active)
    }

    /// Number of calls that reached a final status (`ended` or `failed`)
    pub fn calls_finished(&self) -> u64 {
        self.calls_ended
    }

    pub fn calls_started(&self) -> u64 {
        self.calls_started
    }

    /// Remote `CALL`: place an outgoing call
    pub fn start_outgoing(&mut self, call_id: CallId, number: &str, now: Instant) -> CallEffects {
        let mut effects = CallEffects::default();
        let call = Call::new(call_id.clone(), number, CallDirection::Outgoing, now);
        self.begin(call, now, &mut effects);
        effects.actuations.push(Actuation::PlaceCall {
            call_id,
            number: number.to_string(),
        });
        effects
    }

    /// Remote `END_CALL`: hang up and end whatever call is current
    ///
    /// A mismatched id is logged but still ends the current call; with no
    /// current call this is a no-op.
    pub fn end_current(&mut self, requested: Option<&CallId>, now: Instant) -> CallEffects {
        let mut effects = CallEffects::default();
        let Some(call) = self.current.as_ref() else {
            debug!(requested = ?requested, "END_CALL with no current call");
            return effects;
        };

        if let Some(requested) = requested {
            if *requested != call.call_id {
                warn!(
                    requested = %requested,
                    current = %call.call_id,
                    "END_CALL for a different call id, ending the current call"
                );
            }
        }

        effects.actuations.push(Actuation::HangUp {
            call_id: call.call_id.clone(),
        });
        self.finish(CallStatus::Ended, now, &mut effects);
        effects
    }

    /// Remote `ANSWER_CALL`: answer the ringing incoming call, if any
    ///
    /// The transition to `Active` happens when the off-hook signal arrives.
    pub fn answer(&mut self) -> Option<Actuation> {
        let call = self.current.as_ref()?;
        if call.state != CallState::Ringing {
            return None;
        }
        Some(Actuation::Answer {
            call_id: call.call_id.clone(),
        })
    }

    /// Remote `SEND_DTMF`: forward a tone into the active call
    pub fn send_tone(&self, digit: char) -> Option<Actuation> {
        self.active_call().map(|call| Actuation::SendTone {
            call_id: call.call_id.clone(),
            digit,
        })
    }

    /// Remote `PLAY_AUDIO`: play a file into the active call
    pub fn play_audio(&self, audio: AudioRef) -> Option<Actuation> {
        self.active_call().map(|call| Actuation::PlayAudio {
            call_id: call.call_id.clone(),
            audio,
        })
    }

    /// Local telephony signal
    pub fn on_signal(&mut self, signal: TelephonySignal, now: Instant) -> CallEffects {
        let mut effects = CallEffects::default();

        match signal {
            TelephonySignal::Ringing { number } => {
                if self.is_current(CallState::Ringing, CallDirection::Incoming, &number) {
                    debug!(number = %number, "Repeated ringing signal ignored");
                    return effects;
                }
                let call = Call::new(CallId::generate(), number, CallDirection::Incoming, now);
                self.begin(call, now, &mut effects);
            }

            TelephonySignal::Outgoing { number } => {
                if self.is_current(CallState::Dialing, CallDirection::Outgoing, &number) {
                    debug!(number = %number, "Outgoing signal matches the call being dialed");
                    return effects;
                }
                let call = Call::new(CallId::generate(), number, CallDirection::Outgoing, now);
                self.begin(call, now, &mut effects);
            }

            TelephonySignal::OffHook => match self.current.as_mut() {
                Some(call) if call.state.is_pending() => {
                    call.state = CallState::Active;
                    call.active_since = Some(now);
                    info!(call_id = %call.call_id, direction = call.direction.as_str(), "Call active");
                    effects.updates.push(call.status_update(CallStatus::Active, now));
                }
                Some(call) => {
                    debug!(call_id = %call.call_id, state = ?call.state, "Off-hook ignored");
                }
                None => {
                    debug!("Off-hook with no tracked call");
                }
            },

            TelephonySignal::Idle => {
                if self.current.is_some() {
                    self.finish(CallStatus::Ended, now, &mut effects);
                } else {
                    debug!("Idle signal with no current call");
                }
            }
        }

        effects
    }

    /// A call-setting actuation failed on the platform
    ///
    /// Failures of `place_call` or `answer` for the current call report
    /// `failed` and reset to idle. Anything else is only logged.
    pub fn on_actuation_failed(&mut self, kind: ActuationKind, call_id: &CallId, now: Instant) -> CallEffects {
        let mut effects = CallEffects::default();
        let is_current = self.current.as_ref().map(|call| &call.call_id == call_id).unwrap_or(false);

        match kind {
            ActuationKind::PlaceCall | ActuationKind::Answer if is_current => {
                self.finish(CallStatus::Failed, now, &mut effects);
            }
            _ => {
                debug!(call_id = %call_id, action = kind.as_str(), "Actuation failure does not change call state");
            }
        }

        effects
    }

    fn is_current(&self, state: CallState, direction: CallDirection, number: &str) -> bool {
        self.current
            .as_ref()
            .map(|call| call.state == state && call.direction == direction && call.phone_number == number)
            .unwrap_or(false)
    }

    /// Make `call` current, forcing any previous call to end first
    fn begin(&mut self, call: Call, now: Instant, effects: &mut CallEffects) {
        if let Some(previous) = self.current.as_ref() {
            info!(
                previous = %previous.call_id,
                next = %call.call_id,
                "New call while another is current, ending the previous call"
            );
            effects.actuations.push(Actuation::HangUp {
                call_id: previous.call_id.clone(),
            });
            self.finish(CallStatus::Ended, now, effects);
        }

        info!(
            call_id = %call.call_id,
            number = %call.phone_number,
            direction = call.direction.as_str(),
            "Call started"
        );
        effects.updates.push(call.status_update(CallStatus::Dialing, now));
        self.calls_started += 1;
        self.current = Some(call);
    }

    /// Retire the current call with a final status; no-op without one
    fn finish(&mut self, status: CallStatus, now: Instant, effects: &mut CallEffects) {
        if let Some(mut call) = self.current.take() {
            let update = call.status_update(status, now);
            call.state = CallState::Ended;
            self.calls_ended += 1;
            info!(
                call_id = %call.call_id,
                status = status.as_str(),
                duration_secs = update.duration_secs,
                "Call finished"
            );
            effects.updates.push(update);
        }
    }
}
