//! Line-oriented telephony observer
//!
//! The handset's telephony stack (or a modem script) writes one event per
//! line:
//!
//! ```text
//! ringing +15551234
//! outgoing +15559876
//! offhook
//! idle
//! ```

use anyhow::{bail, Result};
use handset_link_core::{EngineHandle, TelephonySignal};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

/// Parse one observer line; blank lines and `#` comments yield `None`
pub fn parse_signal(line: &str) -> Result<Option<TelephonySignal>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let signal = match (word.to_ascii_lowercase().as_str(), rest) {
        ("ringing", number) => TelephonySignal::Ringing {
            number: number.to_string(),
        },
        ("outgoing", number) => TelephonySignal::Outgoing {
            number: number.to_string(),
        },
        ("offhook", "") => TelephonySignal::OffHook,
        ("idle", "") => TelephonySignal::Idle,
        ("offhook" | "idle", extra) => bail!("unexpected argument to {word}: {extra}"),
        (other, _) => bail!("unknown telephony signal: {other}"),
    };
    Ok(Some(signal))
}

/// Forward signals from `input` until it ends or the engine stops
pub async fn run_observer<R>(input: R, handle: EngineHandle) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        match parse_signal(&line) {
            Ok(Some(signal)) => {
                debug!(signal = signal.label(), "Telephony signal observed");
                if handle.telephony_signal(signal).await.is_err() {
                    debug!("Engine stopped, observer exiting");
                    return Ok(());
                }
            }
            Ok(None) => {}
            Err(e) => warn!(line = %line, error = %e, "Ignoring observer line"),
        }
    }
    info!("Telephony observer input closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signals() {
        assert_eq!(
            parse_signal("ringing +15551234").unwrap(),
            Some(TelephonySignal::Ringing {
                number: "+15551234".to_string()
            })
        );
        assert_eq!(
            parse_signal("  OUTGOING   555 0100 ").unwrap(),
            Some(TelephonySignal::Outgoing {
                number: "555 0100".to_string()
            })
        );
        assert_eq!(parse_signal("offhook").unwrap(), Some(TelephonySignal::OffHook));
        assert_eq!(parse_signal("idle\r").unwrap(), Some(TelephonySignal::Idle));
    }

    #[test]
    fn test_ringing_without_number_is_allowed() {
        assert_eq!(
            parse_signal("ringing").unwrap(),
            Some(TelephonySignal::Ringing { number: String::new() })
        );
    }

    #[test]
    fn test_blank_and_comment_lines_skipped() {
        assert_eq!(parse_signal("").unwrap(), None);
        assert_eq!(parse_signal("   ").unwrap(), None);
        assert_eq!(parse_signal("# modem restarted").unwrap(), None);
    }

    #[test]
    fn test_bad_lines_rejected() {
        assert!(parse_signal("hold").is_err());
        assert!(parse_signal("idle now").is_err());
    }
}
