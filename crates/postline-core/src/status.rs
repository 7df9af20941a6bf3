//! Provider status vocabulary translation.
//!
//! The provider reports tracking events with its own status strings. These
//! are folded onto the application's mail-piece lifecycle by a fixed lookup
//! table. Unrecognised statuses translate to [`MailStatus::Unknown`] so
//! history can always be recorded, even for vocabulary added by the
//! provider after this table was written.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Internal lifecycle status of a mail piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailStatus {
    /// Accepted by the provider, not yet in the postal stream.
    Submitted,
    /// Moving through the postal network.
    InTransit,
    /// Arrived at the destination's local facility.
    InLocalArea,
    /// Delivered to the recipient.
    Delivered,
    /// Returned to sender.
    Returned,
    /// Cancelled or failed at the provider.
    Failed,
    /// Provider status not present in the translation table.
    Unknown,
}

impl MailStatus {
    /// Stable string form used for persistence and API responses.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::InTransit => "in_transit",
            Self::InLocalArea => "in_local_area",
            Self::Delivered => "delivered",
            Self::Returned => "returned",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    /// Whether no further physical progress is expected.
    ///
    /// Terminal statuses are informational only: the provider may still
    /// redeliver or send out-of-order events, and those are recorded.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Returned | Self::Failed)
    }
}

impl fmt::Display for MailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MailStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "in_transit" => Ok(Self::InTransit),
            "in_local_area" => Ok(Self::InLocalArea),
            "delivered" => Ok(Self::Delivered),
            "returned" => Ok(Self::Returned),
            "failed" => Ok(Self::Failed),
            "unknown" => Ok(Self::Unknown),
            other => Err(CoreError::InvalidInput(format!("unknown mail status: {other}"))),
        }
    }
}

/// Maps provider status strings to [`MailStatus`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusTranslator;

impl StatusTranslator {
    /// Translates a provider status. Never fails.
    ///
    /// Surrounding whitespace is ignored and matching is ASCII
    /// case-insensitive.
    pub fn map(provider_status: &str) -> MailStatus {
        let normalized = provider_status.trim().to_ascii_lowercase();

        match normalized.as_str() {
            "delivered" => MailStatus::Delivered,
            "returned" | "returned_to_sender" => MailStatus::Returned,
            "re-routed" | "in_transit" => MailStatus::InTransit,
            "processed_for_delivery" | "in_local_area" => MailStatus::InLocalArea,
            "processing" | "printed" | "mailed" | "created" => MailStatus::Submitted,
            "cancelled" | "failed" => MailStatus::Failed,
            _ => MailStatus::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_entries_translate() {
        let cases = [
            ("delivered", MailStatus::Delivered),
            ("returned", MailStatus::Returned),
            ("returned_to_sender", MailStatus::Returned),
            ("re-routed", MailStatus::InTransit),
            ("in_transit", MailStatus::InTransit),
            ("processed_for_delivery", MailStatus::InLocalArea),
            ("in_local_area", MailStatus::InLocalArea),
            ("processing", MailStatus::Submitted),
            ("printed", MailStatus::Submitted),
            ("mailed", MailStatus::Submitted),
            ("created", MailStatus::Submitted),
            ("cancelled", MailStatus::Failed),
            ("failed", MailStatus::Failed),
        ];

        for (input, expected) in cases {
            assert_eq!(StatusTranslator::map(input), expected, "input {input}");
        }
    }

    #[test]
    fn unrecognised_status_is_unknown() {
        assert_eq!(StatusTranslator::map("totally_new_status"), MailStatus::Unknown);
        assert_eq!(StatusTranslator::map(""), MailStatus::Unknown);
    }

    #[test]
    fn whitespace_and_case_are_ignored() {
        assert_eq!(StatusTranslator::map("  Delivered "), MailStatus::Delivered);
        assert_eq!(StatusTranslator::map("RE-ROUTED"), MailStatus::InTransit);
    }

    #[test]
    fn string_form_round_trips() {
        for status in [
            MailStatus::Submitted,
            MailStatus::InTransit,
            MailStatus::InLocalArea,
            MailStatus::Delivered,
            MailStatus::Returned,
            MailStatus::Failed,
            MailStatus::Unknown,
        ] {
            assert_eq!(status.as_str().parse::<MailStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<MailStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(MailStatus::Delivered.is_terminal());
        assert!(MailStatus::Returned.is_terminal());
        assert!(MailStatus::Failed.is_terminal());
        assert!(!MailStatus::InTransit.is_terminal());
        assert!(!MailStatus::Unknown.is_terminal());
    }
}
