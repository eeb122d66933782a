//! Adapter state tracking and the settings prompt it drives.

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{error::Result, types::RadioStatus};

/// Map a radio stack's adapter state string onto [`RadioStatus`]
///
/// Understands the CoreBluetooth (`poweredOn`), Android
/// (`STATE_TURNING_OFF`) and plain (`on`) spellings in any case.
/// Anything unrecognised, including `resetting` and `unsupported`, is
/// [`RadioStatus::Unknown`].
#[must_use]
pub fn normalize_state(raw: &str) -> RadioStatus {
    let key: String = raw
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase();
    let key = key.strip_prefix("state").unwrap_or(&key);
    let key = key.strip_prefix("powered").unwrap_or(key);

    match key {
        "on" => RadioStatus::On,
        "off" => RadioStatus::Off,
        "turningon" => RadioStatus::TurningOn,
        "turningoff" => RadioStatus::TurningOff,
        "unauthorized" | "unauthorised" => RadioStatus::Unauthorized,
        _ => RadioStatus::Unknown,
    }
}

/// User-facing request to fix a blocking adapter state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsPrompt {
    /// Status that raised the prompt
    pub status: RadioStatus,
    /// Short title
    pub title: String,
    /// Explanation offering a jump into the system settings
    pub message: String,
}

impl SettingsPrompt {
    /// Prompt for a status, if the status needs one
    #[must_use]
    pub fn for_status(status: RadioStatus) -> Option<Self> {
        let (title, message) = match status {
            RadioStatus::Off => (
                "Bluetooth is off",
                "Turn Bluetooth on to find and control your saber stands. Open settings now?",
            ),
            RadioStatus::Unauthorized => (
                "Bluetooth permission required",
                "This app is not allowed to use Bluetooth. Open settings to grant access?",
            ),
            _ => return None,
        };

        Some(Self {
            status,
            title: title.to_string(),
            message: message.to_string(),
        })
    }
}

/// Host UI hook for confirm/cancel prompts
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Show a prompt; `true` means the user confirmed, `false` cancelled
    async fn confirm(&self, prompt: &SettingsPrompt) -> bool;

    /// Deep-link into the OS settings relevant to `status`
    async fn open_settings(&self, status: RadioStatus) -> Result<()>;
}

/// Show a settings prompt and follow through if the user confirms
///
/// Returns whether the settings were opened.
///
/// # Errors
///
/// Returns the prompter's error if the settings cannot be opened.
pub async fn resolve_prompt(prompter: &dyn Prompter, prompt: &SettingsPrompt) -> Result<bool> {
    if !prompter.confirm(prompt).await {
        debug!("Settings prompt for {} dismissed", prompt.status);
        return Ok(false);
    }

    info!("Opening settings to resolve Bluetooth {}", prompt.status);
    prompter.open_settings(prompt.status).await?;
    Ok(true)
}

/// Process-wide radio status
///
/// Status is only ever changed by [`RadioMonitor::record`]. The monitor
/// reports transitions; deciding to scan when the radio comes on is left
/// to the caller.
#[derive(Debug)]
pub struct RadioMonitor {
    status: watch::Sender<RadioStatus>,
}

impl Default for RadioMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioMonitor {
    /// Create a monitor in [`RadioStatus::Unknown`]
    #[must_use]
    pub fn new() -> Self {
        let (status, _) = watch::channel(RadioStatus::Unknown);
        Self { status }
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> RadioStatus {
        *self.status.borrow()
    }

    /// Watch status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RadioStatus> {
        self.status.subscribe()
    }

    /// Record an adapter state report
    ///
    /// Returns a prompt when the status just moved into a state the user
    /// has to resolve. Repeated reports of the same state do not prompt
    /// again. The new status is recorded before the prompt is returned, so
    /// an unanswered prompt never holds back later transitions.
    pub fn record(&self, raw: &str) -> Option<SettingsPrompt> {
        let status = normalize_state(raw);
        let previous = self.status.send_replace(status);
        if previous == status {
            debug!("Bluetooth still {} ({})", status, raw);
            return None;
        }

        info!("Bluetooth state changed: {} -> {}", previous, status);
        if status.needs_prompt() {
            warn!("Bluetooth is {}, scanning disabled", status);
            SettingsPrompt::for_status(status)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_normalize_vendor_states() {
        let cases = [
            ("on", RadioStatus::On),
            ("PoweredOn", RadioStatus::On),
            ("poweredOff", RadioStatus::Off),
            ("STATE_ON", RadioStatus::On),
            ("STATE_OFF", RadioStatus::Off),
            ("STATE_TURNING_ON", RadioStatus::TurningOn),
            ("turning_off", RadioStatus::TurningOff),
            ("unauthorized", RadioStatus::Unauthorized),
            ("Unauthorised", RadioStatus::Unauthorized),
            ("resetting", RadioStatus::Unknown),
            ("unsupported", RadioStatus::Unknown),
            ("", RadioStatus::Unknown),
        ];
        for (raw, expected) in cases {
            assert_eq!(normalize_state(raw), expected, "{raw:?}");
        }
    }

    #[test]
    fn test_prompt_only_on_transition_into_blocking_state() {
        let monitor = RadioMonitor::new();
        assert_eq!(monitor.status(), RadioStatus::Unknown);

        assert!(monitor.record("PoweredOn").is_none());
        assert_eq!(monitor.status(), RadioStatus::On);

        let prompt = monitor.record("PoweredOff").unwrap();
        assert_eq!(prompt.status, RadioStatus::Off);
        assert!(monitor.record("off").is_none());

        let prompt = monitor.record("unauthorized").unwrap();
        assert_eq!(prompt.status, RadioStatus::Unauthorized);

        assert!(monitor.record("turning_on").is_none());
        assert_eq!(monitor.status(), RadioStatus::TurningOn);
    }

    #[test]
    fn test_subscribers_see_every_recorded_status() {
        let monitor = RadioMonitor::new();
        let mut rx = monitor.subscribe();

        let _unanswered = monitor.record("off");
        monitor.record("on");
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), RadioStatus::On);
    }

    struct ScriptedPrompter {
        answer: bool,
        opened: AtomicUsize,
    }

    #[async_trait]
    impl Prompter for ScriptedPrompter {
        async fn confirm(&self, _: &SettingsPrompt) -> bool {
            self.answer
        }

        async fn open_settings(&self, _: RadioStatus) -> Result<()> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_resolve_prompt_cancel_and_confirm() {
        let prompt = SettingsPrompt::for_status(RadioStatus::Off).unwrap();

        let cancel = ScriptedPrompter {
            answer: false,
            opened: AtomicUsize::new(0),
        };
        assert!(!resolve_prompt(&cancel, &prompt).await.unwrap());
        assert_eq!(cancel.opened.load(Ordering::SeqCst), 0);

        let confirm = ScriptedPrompter {
            answer: true,
            opened: AtomicUsize::new(0),
        };
        assert!(resolve_prompt(&confirm, &prompt).await.unwrap());
        assert_eq!(confirm.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_prompt_for_non_blocking_states() {
        for status in [
            RadioStatus::On,
            RadioStatus::TurningOn,
            RadioStatus::TurningOff,
            RadioStatus::Unknown,
        ] {
            assert!(SettingsPrompt::for_status(status).is_none());
        }
    }
}
