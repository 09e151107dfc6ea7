//! The `{Error | success}` reply discipline shared by action-style services

use tracing::warn;

use crate::{LocsimError, ProtocolError, variant::field};

/// How a service answered an action request
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ActionOutcome {
    Succeeded,
    /// `success: false` with no further explanation
    Rejected,
    /// The service explained its refusal
    Failed(String),
}

impl ActionOutcome {
    /// Reads the outcome out of a response mapping
    ///
    /// `Error` takes precedence over `success`. A response with neither is malformed,
    /// as is one where either key has the wrong kind.
    pub(crate) fn from_response(res: &plist::Dictionary) -> Result<Self, ProtocolError> {
        if let Some(message) = field::<String>(res, "Error")? {
            return Ok(Self::Failed(message));
        }
        match field::<bool>(res, "success")? {
            Some(true) => Ok(Self::Succeeded),
            Some(false) => Ok(Self::Rejected),
            None => {
                warn!("Action response carries neither Error nor success");
                Err(ProtocolError::MalformedResponse)
            }
        }
    }

    /// Collapses the outcome into the error taxonomy of a plain action
    pub(crate) fn into_result(self, rejected: &str) -> Result<(), LocsimError> {
        match self {
            Self::Succeeded => Ok(()),
            Self::Rejected => Err(LocsimError::Application(rejected.to_string())),
            Self::Failed(message) => Err(LocsimError::Application(message)),
        }
    }
}
