//! Inbound command dispatch
//!
//! Commands are matched on the exact envelope `type`. Each handler reads its
//! typed payload, applies it to the call coordinator and builds the response
//! envelope. Handlers never touch the transport or the actuator: they return
//! what should be sent and actuated, and the engine does it in order.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::call::{CallEffects, CallId, CallStateCoordinator};
use crate::connection::{audio_download_url, ConnectionState};
use crate::device::{AudioRef, TelemetrySource};
use crate::envelope::{kinds, Envelope};
use crate::error::{LinkError, LinkResult};

/// Commands the handset understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Call,
    EndCall,
    AnswerCall,
    SendDtmf,
    PlayAudio,
    GetStatus,
    Restart,
    /// Keepalive acknowledgment
    Pong,
}

impl CommandKind {
    /// Look up a command by its wire type; `None` for anything unknown
    pub fn from_type(kind: &str) -> Option<Self> {
        match kind {
            kinds::CALL => Some(CommandKind::Call),
            kinds::END_CALL => Some(CommandKind::EndCall),
            kinds::ANSWER_CALL => Some(CommandKind::AnswerCall),
            kinds::SEND_DTMF => Some(CommandKind::SendDtmf),
            kinds::PLAY_AUDIO => Some(CommandKind::PlayAudio),
            kinds::GET_STATUS => Some(CommandKind::GetStatus),
            kinds::RESTART => Some(CommandKind::Restart),
            kinds::PONG => Some(CommandKind::Pong),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Call => kinds::CALL,
            CommandKind::EndCall => kinds::END_CALL,
            CommandKind::AnswerCall => kinds::ANSWER_CALL,
            CommandKind::SendDtmf => kinds::SEND_DTMF,
            CommandKind::PlayAudio => kinds::PLAY_AUDIO,
            CommandKind::GetStatus => kinds::GET_STATUS,
            CommandKind::Restart => kinds::RESTART,
            CommandKind::Pong => kinds::PONG,
        }
    }

    pub fn response_type(&self) -> Option<&'static str> {
        match self {
            CommandKind::Call => Some(kinds::CALL_RESPONSE),
            CommandKind::EndCall => Some(kinds::END_CALL_RESPONSE),
            CommandKind::AnswerCall => Some(kinds::ANSWER_CALL_RESPONSE),
            CommandKind::SendDtmf => Some(kinds::DTMF_RESPONSE),
            CommandKind::PlayAudio => Some(kinds::PLAY_AUDIO_RESPONSE),
            CommandKind::GetStatus => Some(kinds::STATUS_RESPONSE),
            CommandKind::Restart => Some(kinds::RESTART_RESPONSE),
            CommandKind::Pong => None,
        }
    }
}

/// State a handler may read or change
pub struct DispatchContext<'a> {
    pub coordinator: &'a mut CallStateCoordinator,
    pub telemetry: &'a dyn TelemetrySource,
    pub connection_state: ConnectionState,
    /// Endpoint of the live link, used to locate server-hosted audio
    pub endpoint: Option<&'a Url>,
    pub restart_delay: Duration,
    pub now: Instant,
}

/// What a handler wants done
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub response: Option<Envelope>,
    pub effects: CallEffects,
    pub restart_requested: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallCommand {
    call_id: String,
    phone_number: String,
    #[serde(default)]
    direction: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallRef {
    #[serde(default)]
    call_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DtmfCommand {
    #[serde(default)]
    call_id: Option<String>,
    digit: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayAudioCommand {
    #[serde(default)]
    call_id: Option<String>,
    audio_file_id: Value,
}

/// Whether `digit` is a single DTMF symbol: `0-9`, `*`, `#` or `A-D`
pub fn is_dtmf_digit(digit: &str) -> bool {
    let mut chars = digit.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => c.is_ascii_digit() || matches!(c, '*' | '#' | 'A'..='D'),
        _ => false,
    }
}

/// Run the handler for `kind`
///
/// An `Err` means the payload was unusable: the caller drops the frame and
/// sends nothing back.
pub fn dispatch(kind: CommandKind, request: &Envelope, ctx: DispatchContext<'_>) -> LinkResult<DispatchOutcome> {
    debug!(command = kind.as_str(), message_id = request.message_id(), "Dispatching command");
    match kind {
        CommandKind::Call => handle_call(request, ctx),
        CommandKind::EndCall => handle_end_call(request, ctx),
        CommandKind::AnswerCall => handle_answer(request, ctx),
        CommandKind::SendDtmf => handle_dtmf(request, ctx),
        CommandKind::PlayAudio => handle_play_audio(request, ctx),
        CommandKind::GetStatus => Ok(handle_status(request, ctx)),
        CommandKind::Restart => Ok(handle_restart(request, ctx)),
        CommandKind::Pong => {
            debug!("Keepalive acknowledged");
            Ok(DispatchOutcome::default())
        }
    }
}

fn non_blank(kind: &str, field: &str, value: &str) -> LinkResult<()> {
    if value.trim().is_empty() {
        return Err(LinkError::invalid_payload(kind, format!("`{}` is empty", field)));
    }
    Ok(())
}

fn handle_call(request: &Envelope, ctx: DispatchContext<'_>) -> LinkResult<DispatchOutcome> {
    let command: CallCommand = request.payload_as()?;
    non_blank(kinds::CALL, "callId", &command.call_id)?;
    non_blank(kinds::CALL, "phoneNumber", &command.phone_number)?;
    if let Some(direction) = command.direction.as_deref() {
        if direction != "outgoing" {
            warn!(direction = %direction, "CALL with unexpected direction, placing an outgoing call");
        }
    }

    info!(call_id = %command.call_id, number = %command.phone_number, "Remote call requested");
    let call_id = CallId::new(command.call_id);
    let effects = ctx.coordinator.start_outgoing(call_id.clone(), &command.phone_number, ctx.now);

    let response = Envelope::response_to(request, kinds::CALL_RESPONSE)
        .with_field("callId", call_id.as_str())
        .with_field("status", "accepted");
    Ok(DispatchOutcome {
        response: Some(response),
        effects,
        restart_requested: false,
    })
}

fn handle_end_call(request: &Envelope, ctx: DispatchContext<'_>) -> LinkResult<DispatchOutcome> {
    let command: CallRef = request.payload_as()?;
    let requested = command.call_id.filter(|id| !id.is_empty()).map(CallId::new);
    let current = ctx.coordinator.current().map(|call| call.call_id.clone());

    let effects = ctx.coordinator.end_current(requested.as_ref(), ctx.now);

    let echoed = requested.or(current);
    let response = Envelope::response_to(request, kinds::END_CALL_RESPONSE)
        .with_optional_field("callId", echoed.as_ref().map(CallId::as_str))
        .with_field("status", "completed");
    Ok(DispatchOutcome {
        response: Some(response),
        effects,
        restart_requested: false,
    })
}

fn handle_answer(request: &Envelope, ctx: DispatchContext<'_>) -> LinkResult<DispatchOutcome> {
    let command: CallRef = request.payload_as()?;
    let mut effects = CallEffects::default();

    let status = match ctx.coordinator.answer() {
        Some(actuation) => {
            info!(call_id = %actuation.call_id(), "Answering incoming call");
            effects.actuations.push(actuation);
            "answering"
        }
        None => {
            debug!(state = ?ctx.coordinator.state(), "ANSWER_CALL with no ringing call");
            "no_ringing_call"
        }
    };

    let call_id = command
        .call_id
        .or_else(|| ctx.coordinator.current().map(|call| call.call_id.to_string()));
    let response = Envelope::response_to(request, kinds::ANSWER_CALL_RESPONSE)
        .with_optional_field("callId", call_id)
        .with_field("status", status);
    Ok(DispatchOutcome {
        response: Some(response),
        effects,
        restart_requested: false,
    })
}

fn handle_dtmf(request: &Envelope, ctx: DispatchContext<'_>) -> LinkResult<DispatchOutcome> {
    let command: DtmfCommand = request.payload_as()?;
    let mut effects = CallEffects::default();

    let status = if !is_dtmf_digit(&command.digit) {
        warn!(digit = %command.digit, "Rejecting invalid DTMF digit");
        "invalid_digit"
    } else {
        let digit = command.digit.chars().next().unwrap_or_default();
        match ctx.coordinator.send_tone(digit) {
            Some(actuation) => {
                effects.actuations.push(actuation);
                "sent"
            }
            None => {
                debug!(digit = %digit, "DTMF with no active call");
                "no_active_call"
            }
        }
    };

    let call_id = command
        .call_id
        .or_else(|| ctx.coordinator.active_call().map(|call| call.call_id.to_string()));
    let response = Envelope::response_to(request, kinds::DTMF_RESPONSE)
        .with_optional_field("callId", call_id)
        .with_field("digit", command.digit)
        .with_field("status", status);
    Ok(DispatchOutcome {
        response: Some(response),
        effects,
        restart_requested: false,
    })
}

fn handle_play_audio(request: &Envelope, ctx: DispatchContext<'_>) -> LinkResult<DispatchOutcome> {
    let command: PlayAudioCommand = request.payload_as()?;
    let file_id = match &command.audio_file_id {
        Value::String(id) if !id.trim().is_empty() => id.clone(),
        Value::Number(id) => id.to_string(),
        other => {
            return Err(LinkError::invalid_payload(
                kinds::PLAY_AUDIO,
                format!("`audioFileId` must be a string or number, got {}", other),
            ))
        }
    };

    let audio = AudioRef {
        url: ctx.endpoint.map(|endpoint| audio_download_url(endpoint, &file_id)),
        file_id,
    };
    let mut effects = CallEffects::default();
    let status = match ctx.coordinator.play_audio(audio) {
        Some(actuation) => {
            effects.actuations.push(actuation);
            "playing"
        }
        None => "no_active_call",
    };

    let call_id = command
        .call_id
        .or_else(|| ctx.coordinator.active_call().map(|call| call.call_id.to_string()));
    let response = Envelope::response_to(request, kinds::PLAY_AUDIO_RESPONSE)
        .with_optional_field("callId", call_id)
        .with_field("audioFileId", command.audio_file_id)
        .with_field("status", status);
    Ok(DispatchOutcome {
        response: Some(response),
        effects,
        restart_requested: false,
    })
}

fn handle_status(request: &Envelope, ctx: DispatchContext<'_>) -> DispatchOutcome {
    let telemetry = ctx.telemetry.snapshot();
    let call_id = ctx.coordinator.current().map(|call| call.call_id.to_string());

    let response = Envelope::response_to(request, kinds::STATUS_RESPONSE)
        .with_field("batteryLevel", telemetry.battery_level)
        .with_field("isCharging", telemetry.is_charging)
        .with_field("networkType", telemetry.network_type)
        .with_field("signalStrength", telemetry.signal_strength)
        .with_field("connectionStatus", ctx.connection_state.as_str())
        .with_field("callState", ctx.coordinator.state().as_str())
        .with_optional_field("callId", call_id);
    DispatchOutcome {
        response: Some(response),
        ..Default::default()
    }
}

fn handle_restart(request: &Envelope, ctx: DispatchContext<'_>) -> DispatchOutcome {
    let delay_ms = ctx.restart_delay.as_millis() as u64;
    info!(delay_ms, "Restart requested by server");
    let response = Envelope::response_to(request, kinds::RESTART_RESPONSE)
        .with_field("status", "restarting")
        .with_field("delayMs", delay_ms);
    DispatchOutcome {
        response: Some(response),
        effects: CallEffects::default(),
        restart_requested: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{Actuation, CallState};
    use crate::device::{TelemetrySnapshot, TelephonySignal};

    struct FixedTelemetry(TelemetrySnapshot);

    impl TelemetrySource for FixedTelemetry {
        fn snapshot(&self) -> TelemetrySnapshot {
            self.0.clone()
        }
    }

    fn telemetry() -> FixedTelemetry {
        FixedTelemetry(TelemetrySnapshot {
            battery_level: 64,
            is_charging: false,
            network_type: "4G".into(),
            signal_strength: 3,
        })
    }

    fn run(
        coordinator: &mut CallStateCoordinator,
        endpoint: Option<&Url>,
        request: &Envelope,
    ) -> LinkResult<DispatchOutcome> {
        let telemetry = telemetry();
        let kind = CommandKind::from_type(request.kind()).expect("known command");
        dispatch(
            kind,
            request,
            DispatchContext {
                coordinator,
                telemetry: &telemetry,
                connection_state: ConnectionState::Connected,
                endpoint,
                restart_delay: Duration::from_millis(3_000),
                now: Instant::now(),
            },
        )
    }

    fn active(coordinator: &mut CallStateCoordinator) {
        coordinator.start_outgoing(CallId::from("c1"), "+15550001", Instant::now());
        coordinator.on_signal(TelephonySignal::OffHook, Instant::now());
    }

    #[test]
    fn test_registry_covers_wire_types() {
        for kind in [
            CommandKind::Call,
            CommandKind::EndCall,
            CommandKind::AnswerCall,
            CommandKind::SendDtmf,
            CommandKind::PlayAudio,
            CommandKind::GetStatus,
            CommandKind::Restart,
            CommandKind::Pong,
        ] {
            assert_eq!(CommandKind::from_type(kind.as_str()), Some(kind));
        }
        assert_eq!(CommandKind::from_type("REBOOT_INTO_RECOVERY"), None);
        assert_eq!(CommandKind::from_type("call"), None);
        assert_eq!(CommandKind::Pong.response_type(), None);
    }

    #[test]
    fn test_call_is_accepted_and_placed() {
        let mut coordinator = CallStateCoordinator::new();
        let request = Envelope::new(kinds::CALL)
            .with_message_id("m1")
            .with_field("callId", "c1")
            .with_field("phoneNumber", "+15551234")
            .with_field("direction", "outgoing");

        let outcome = run(&mut coordinator, None, &request).unwrap();
        let response = outcome.response.unwrap();
        assert_eq!(response.kind(), kinds::CALL_RESPONSE);
        assert_eq!(response.str_field("status"), Some("accepted"));
        assert_eq!(response.str_field("callId"), Some("c1"));
        assert_eq!(response.str_field("requestId"), Some("m1"));
        assert_eq!(outcome.effects.updates.len(), 1);
        assert!(matches!(outcome.effects.actuations[0], Actuation::PlaceCall { .. }));
        assert_eq!(coordinator.state(), CallState::Dialing);
    }

    #[test]
    fn test_call_without_number_is_invalid() {
        let mut coordinator = CallStateCoordinator::new();
        for request in [
            Envelope::new(kinds::CALL).with_field("callId", "c1"),
            Envelope::new(kinds::CALL).with_field("callId", "c1").with_field("phoneNumber", 5551234),
            Envelope::new(kinds::CALL).with_field("callId", "c1").with_field("phoneNumber", "  "),
        ] {
            let err = run(&mut coordinator, None, &request).unwrap_err();
            assert_eq!(err.category(), "protocol");
        }
        assert_eq!(coordinator.state(), CallState::Idle);
    }

    #[test]
    fn test_end_call_completes_even_when_idle() {
        let mut coordinator = CallStateCoordinator::new();
        let request = Envelope::new(kinds::END_CALL).with_field("callId", "ghost");
        let outcome = run(&mut coordinator, None, &request).unwrap();

        let response = outcome.response.unwrap();
        assert_eq!(response.str_field("status"), Some("completed"));
        assert_eq!(response.str_field("callId"), Some("ghost"));
        assert!(outcome.effects.is_empty());
    }

    #[test]
    fn test_dtmf_statuses() {
        let mut coordinator = CallStateCoordinator::new();
        let dtmf = |digit: &str| Envelope::new(kinds::SEND_DTMF).with_field("digit", digit);

        let outcome = run(&mut coordinator, None, &dtmf("5")).unwrap();
        assert_eq!(outcome.response.unwrap().str_field("status"), Some("no_active_call"));

        active(&mut coordinator);
        let outcome = run(&mut coordinator, None, &dtmf("#")).unwrap();
        let response = outcome.response.unwrap();
        assert_eq!(response.str_field("status"), Some("sent"));
        assert_eq!(response.str_field("callId"), Some("c1"));
        assert_eq!(
            outcome.effects.actuations,
            vec![Actuation::SendTone { call_id: CallId::from("c1"), digit: '#' }]
        );

        for bad in ["E", "12", "", "x"] {
            let outcome = run(&mut coordinator, None, &dtmf(bad)).unwrap();
            assert_eq!(outcome.response.unwrap().str_field("status"), Some("invalid_digit"));
            assert!(outcome.effects.actuations.is_empty());
        }
    }

    #[test]
    fn test_dtmf_digit_set() {
        for digit in ["0", "9", "*", "#", "A", "D"] {
            assert!(is_dtmf_digit(digit), "{digit}");
        }
        for digit in ["a", "E", "+", " ", "55"] {
            assert!(!is_dtmf_digit(digit), "{digit}");
        }
    }

    #[test]
    fn test_play_audio_builds_download_url() {
        let endpoint = Url::parse("wss://phone.example.com/ws").unwrap();
        let mut coordinator = CallStateCoordinator::new();
        active(&mut coordinator);

        let request = Envelope::new(kinds::PLAY_AUDIO).with_field("audioFileId", 42);
        let outcome = run(&mut coordinator, Some(&endpoint), &request).unwrap();

        let response = outcome.response.unwrap();
        assert_eq!(response.str_field("status"), Some("playing"));
        assert_eq!(response.field("audioFileId").and_then(|v| v.as_u64()), Some(42));
        match &outcome.effects.actuations[0] {
            Actuation::PlayAudio { audio, .. } => {
                assert_eq!(audio.file_id, "42");
                assert_eq!(
                    audio.url.as_deref(),
                    Some("https://phone.example.com/api/audio-files/42/download")
                );
            }
            other => panic!("unexpected actuation {other:?}"),
        }
    }

    #[test]
    fn test_play_audio_needs_active_call_and_valid_id() {
        let mut coordinator = CallStateCoordinator::new();
        let outcome = run(
            &mut coordinator,
            None,
            &Envelope::new(kinds::PLAY_AUDIO).with_field("audioFileId", "intro"),
        )
        .unwrap();
        assert_eq!(outcome.response.unwrap().str_field("status"), Some("no_active_call"));

        let err = run(
            &mut coordinator,
            None,
            &Envelope::new(kinds::PLAY_AUDIO).with_field("audioFileId", true),
        )
        .unwrap_err();
        assert!(matches!(err, LinkError::InvalidPayload { .. }));
    }

    #[test]
    fn test_answer_only_when_ringing() {
        let mut coordinator = CallStateCoordinator::new();
        let request = Envelope::new(kinds::ANSWER_CALL);

        let outcome = run(&mut coordinator, None, &request).unwrap();
        assert_eq!(outcome.response.unwrap().str_field("status"), Some("no_ringing_call"));

        coordinator.on_signal(TelephonySignal::Ringing { number: "+1555".into() }, Instant::now());
        let outcome = run(&mut coordinator, None, &request).unwrap();
        assert_eq!(outcome.response.unwrap().str_field("status"), Some("answering"));
        assert!(matches!(outcome.effects.actuations[0], Actuation::Answer { .. }));
    }

    #[test]
    fn test_status_reports_telemetry_and_call() {
        let mut coordinator = CallStateCoordinator::new();
        active(&mut coordinator);

        let outcome = run(&mut coordinator, None, &Envelope::new(kinds::GET_STATUS)).unwrap();
        let response = outcome.response.unwrap();
        assert_eq!(response.field("batteryLevel").and_then(|v| v.as_u64()), Some(64));
        assert_eq!(response.field("isCharging").and_then(|v| v.as_bool()), Some(false));
        assert_eq!(response.str_field("networkType"), Some("4G"));
        assert_eq!(response.field("signalStrength").and_then(|v| v.as_u64()), Some(3));
        assert_eq!(response.str_field("connectionStatus"), Some("connected"));
        assert_eq!(response.str_field("callState"), Some("active"));
        assert_eq!(response.str_field("callId"), Some("c1"));
    }

    #[test]
    fn test_restart_is_acknowledged() {
        let mut coordinator = CallStateCoordinator::new();
        let outcome = run(&mut coordinator, None, &Envelope::new(kinds::RESTART)).unwrap();
        assert!(outcome.restart_requested);
        let response = outcome.response.unwrap();
        assert_eq!(response.str_field("status"), Some("restarting"));
        assert_eq!(response.field("delayMs").and_then(|v| v.as_u64()), Some(3_000));
    }
}
