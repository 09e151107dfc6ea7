//! Developer mode
//!
//! Since iOS 16 developer services refuse to start until the user switches
//! Developer Mode on, which takes a reboot. The toggle is hidden in Settings
//! until something asks AMFI to reveal it; revealing is the only step this
//! controller performs. The user does the rest on the device.

use tracing::{debug, info};

use crate::{
    LocsimError, ServiceSession,
    action::ActionOutcome,
    variant::FromVariant,
};

/// What is known about developer mode on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeveloperModeStatus {
    /// Nothing has been read yet
    #[default]
    Unknown,
    Disabled,
    /// The toggle was revealed, but the device still reports developer mode off
    RevealPending,
    Enabled,
}

impl DeveloperModeStatus {
    /// The state after the device reported `enabled`
    pub fn observe(self, enabled: bool) -> Self {
        match (self, enabled) {
            (_, true) => Self::Enabled,
            (Self::RevealPending, false) => Self::RevealPending,
            (_, false) => Self::Disabled,
        }
    }
}

/// Request codes understood by `com.apple.amfi.lockdown`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeveloperModeAction {
    /// Show the Developer Mode toggle in Settings
    Reveal = 0,
    /// Switch developer mode on; the device reboots
    Enable = 1,
    /// Show the post-reboot confirmation prompt
    PromptAccept = 2,
}

impl DeveloperModeAction {
    pub fn code(self) -> u64 {
        self as u64
    }
}

/// Reads and advances the developer mode state of one device
#[derive(Debug)]
pub struct DeveloperModeController<'s> {
    session: &'s mut ServiceSession,
    state: DeveloperModeStatus,
}

impl<'s> DeveloperModeController<'s> {
    pub const SERVICE_NAME: &'static str = "com.apple.amfi.lockdown";
    pub const STATUS_DOMAIN: &'static str = "com.apple.security.mac.amfi";
    pub const STATUS_KEY: &'static str = "DeveloperModeStatus";

    pub fn new(session: &'s mut ServiceSession) -> Self {
        Self {
            session,
            state: DeveloperModeStatus::Unknown,
        }
    }

    /// The state as of the last call, without asking the device
    pub fn state(&self) -> DeveloperModeStatus {
        self.state
    }

    /// Reads whether developer mode is on
    ///
    /// # Errors
    /// `Protocol` if the device answers with anything but a boolean. An unreadable
    /// status never counts as disabled, and leaves the known state untouched.
    pub async fn status(&mut self) -> Result<DeveloperModeStatus, LocsimError> {
        let value = self
            .session
            .get_value(Some(Self::STATUS_DOMAIN), Self::STATUS_KEY)
            .await?;
        let enabled = bool::from_variant(&value)?;

        self.state = self.state.observe(enabled);
        debug!("Developer mode status: {:?}", self.state);
        Ok(self.state)
    }

    /// Asks the device to show the Developer Mode toggle
    ///
    /// # Errors
    /// * `Application` if the device reports a failure or answers `success: false`
    /// * `Protocol` if the response carries neither `Error` nor `success`
    pub async fn reveal(&mut self) -> Result<(), LocsimError> {
        let outcome = self.send_action(DeveloperModeAction::Reveal).await?;
        outcome.into_result("enable rejected")?;

        info!("Developer mode toggle revealed");
        self.state = DeveloperModeStatus::RevealPending;
        Ok(())
    }

    async fn send_action(
        &mut self,
        action: DeveloperModeAction,
    ) -> Result<ActionOutcome, LocsimError> {
        let mut channel = self.session.start_service(Self::SERVICE_NAME).await?;
        let conn = channel.connection();

        let mut req = plist::Dictionary::new();
        req.insert("action".into(), action.code().into());
        conn.send_plist(req.into()).await?;

        let res = conn.read_plist().await?;
        Ok(ActionOutcome::from_response(&res)?)
    }
}
