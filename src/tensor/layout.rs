//! Memory layout tags

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Dimension order of a tensor.
///
/// `N`/`C`/`H`/`W`/`D` name activation axes, `O`/`I` name weight axes.
/// The `C1..C0` variants are channel-blocked layouts used by vector kernels,
/// where `C0` is the innermost channel block.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Layout {
    #[default]
    #[serde(rename = "NULL")]
    Null,
    N,
    NC,
    NCW,
    NCHW,
    NCDHW,
    O,
    OI,
    OIW,
    OIHW,
    OIDHW,
    O1HW,
    NWC,
    NHWC,
    NDHWC,
    OWI,
    OHWI,
    ODHWI,
    #[serde(rename = "1HWO")]
    OneHWO,
    NC1C0,
    NC1WC0,
    NC1HWC0,
    NC1DHWC0,
}

impl Layout {
    /// Rank implied by the layout, `None` for `Null`
    pub fn rank(self) -> Option<usize> {
        let r = match self {
            Layout::Null => return None,
            Layout::N | Layout::O => 1,
            Layout::NC | Layout::OI => 2,
            Layout::NCW | Layout::OIW | Layout::NWC | Layout::OWI | Layout::NC1C0 => 3,
            Layout::NCHW
            | Layout::OIHW
            | Layout::O1HW
            | Layout::NHWC
            | Layout::OHWI
            | Layout::OneHWO
            | Layout::NC1WC0 => 4,
            Layout::NCDHW
            | Layout::OIDHW
            | Layout::NDHWC
            | Layout::ODHWI
            | Layout::NC1HWC0 => 5,
            Layout::NC1DHWC0 => 6,
        };
        Some(r)
    }

    /// Channel-blocked layout
    pub fn is_packed(self) -> bool {
        matches!(
            self,
            Layout::NC1C0 | Layout::NC1WC0 | Layout::NC1HWC0 | Layout::NC1DHWC0
        )
    }

    /// Channels-last activation or weight layout
    pub fn is_channel_last(self) -> bool {
        matches!(
            self,
            Layout::NWC | Layout::NHWC | Layout::NDHWC | Layout::OWI | Layout::OHWI | Layout::ODHWI
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Layout::Null => "NULL",
            Layout::N => "N",
            Layout::NC => "NC",
            Layout::NCW => "NCW",
            Layout::NCHW => "NCHW",
            Layout::NCDHW => "NCDHW",
            Layout::O => "O",
            Layout::OI => "OI",
            Layout::OIW => "OIW",
            Layout::OIHW => "OIHW",
            Layout::OIDHW => "OIDHW",
            Layout::O1HW => "O1HW",
            Layout::NWC => "NWC",
            Layout::NHWC => "NHWC",
            Layout::NDHWC => "NDHWC",
            Layout::OWI => "OWI",
            Layout::OHWI => "OHWI",
            Layout::ODHWI => "ODHWI",
            Layout::OneHWO => "1HWO",
            Layout::NC1C0 => "NC1C0",
            Layout::NC1WC0 => "NC1WC0",
            Layout::NC1HWC0 => "NC1HWC0",
            Layout::NC1DHWC0 => "NC1DHWC0",
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_uppercase()))
            .map_err(|_| format!("unknown layout: {}", s))
    }
}
