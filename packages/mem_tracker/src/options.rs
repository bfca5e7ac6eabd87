//! Tracking level and option-string parsing.

use derive_more::Display;

use crate::callsite;
use crate::error::{Error, Result};

/// How much information the tracker records per event.
#[derive(Clone, Copy, Debug, Display, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum TrackingLevel {
    /// Tracking is disabled; every entry point is a no-op.
    #[display("off")]
    Off = 0,

    /// Events are recorded without call-site information.
    #[display("summary")]
    Summary,

    /// Events additionally carry the caller address for later decoding.
    #[display("detail")]
    Detail,
}

impl TrackingLevel {
    /// Parses the runtime option string.
    ///
    /// Exactly `=off`, `=summary` and `=detail` are accepted. `=detail`
    /// downgrades to `=summary` on platforms without native stack walking,
    /// since there would be nothing to decode the recorded addresses with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for any other input; the caller is
    /// expected to treat this as fatal during startup.
    pub fn parse_option_line(option_line: &str) -> Result<Self> {
        match option_line {
            "=off" => Ok(Self::Off),
            "=summary" => Ok(Self::Summary),
            "=detail" => {
                if callsite::can_walk_stack() {
                    Ok(Self::Detail)
                } else {
                    tracing::warn!(
                        "detail tracking is not supported on this platform, using summary instead"
                    );
                    Ok(Self::Summary)
                }
            }
            other => Err(Error::Configuration {
                invalid_value: other.to_string(),
            }),
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Summary,
            2 => Self::Detail,
            _ => Self::Off,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_the_three_literals() {
        assert_eq!(
            TrackingLevel::parse_option_line("=off").unwrap(),
            TrackingLevel::Off
        );
        assert_eq!(
            TrackingLevel::parse_option_line("=summary").unwrap(),
            TrackingLevel::Summary
        );

        // Detail may legitimately downgrade to summary depending on platform.
        let detail = TrackingLevel::parse_option_line("=detail").unwrap();
        assert!(detail >= TrackingLevel::Summary);
    }

    #[test]
    fn rejects_everything_else() {
        for bad in ["", "summary", "=Summary", "=on", "=detail ", " =off"] {
            assert!(
                TrackingLevel::parse_option_line(bad).is_err(),
                "expected '{bad}' to be rejected"
            );
        }
    }

    #[test]
    fn levels_are_ordered() {
        assert!(TrackingLevel::Off < TrackingLevel::Summary);
        assert!(TrackingLevel::Summary < TrackingLevel::Detail);
    }

    #[test]
    fn from_u8_round_trips() {
        for level in [
            TrackingLevel::Off,
            TrackingLevel::Summary,
            TrackingLevel::Detail,
        ] {
            assert_eq!(TrackingLevel::from_u8(level as u8), level);
        }
    }
}
