//! Analog line configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// When the call setup information is delivered relative to the first ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallSetup {
    /// Between the first and second ring.
    #[default]
    After,
    /// Before the first ring.
    Before,
    /// No call setup information.
    None,
}

impl FromStr for CallSetup {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "after" => Ok(CallSetup::After),
            "before" => Ok(CallSetup::Before),
            "none" => Ok(CallSetup::None),
            other => Err(ConfigError::UnknownCallSetup {
                value: other.to_string(),
            }),
        }
    }
}

fn default_callsetup_timeout() -> i64 {
    2000
}

fn default_ring_timeout() -> i64 {
    10000
}

fn default_alarm_timeout() -> i64 {
    30000
}

fn default_delay_dial() -> i64 {
    2000
}

fn default_connect() -> bool {
    true
}

/// Configuration consumed when building an
/// [`AnalogLine`](crate::line::AnalogLine).
///
/// Timer values are milliseconds; a negative value falls back to the
/// documented default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalogLineConfig {
    /// DTMF digits are carried inband; outbound tone events are refused.
    #[serde(rename = "dtmfinband", default)]
    pub inband_dtmf: bool,

    /// Echo canceller state: absent leaves the driver default.
    #[serde(rename = "echocancel", default)]
    pub echo_cancel: Option<bool>,

    /// Answer when a polarity reversal is detected.
    #[serde(rename = "answer-on-polarity", default)]
    pub answer_on_polarity: bool,

    /// Hang up when a polarity reversal is detected.
    #[serde(rename = "hangup-on-polarity", default)]
    pub hangup_on_polarity: bool,

    /// Drive polarity reversals when answering/hanging up.
    #[serde(rename = "polaritycontrol", default)]
    pub polarity_control: bool,

    #[serde(rename = "callsetup", default)]
    pub call_setup: CallSetup,

    #[serde(rename = "callsetup-timeout", default = "default_callsetup_timeout")]
    pub callsetup_timeout: i64,

    #[serde(rename = "ring-timeout", default = "default_ring_timeout")]
    pub ring_timeout: i64,

    #[serde(rename = "alarm-timeout", default = "default_alarm_timeout")]
    pub alarm_timeout: i64,

    #[serde(rename = "delaydial", default = "default_delay_dial")]
    pub delay_dial: i64,

    /// Build the line already out of service.
    #[serde(rename = "out-of-service", default)]
    pub out_of_service: bool,

    /// Connect the circuit as soon as the line is built.
    #[serde(default = "default_connect")]
    pub connect: bool,
}

impl Default for AnalogLineConfig {
    fn default() -> Self {
        Self {
            inband_dtmf: false,
            echo_cancel: None,
            answer_on_polarity: false,
            hangup_on_polarity: false,
            polarity_control: false,
            call_setup: CallSetup::After,
            callsetup_timeout: default_callsetup_timeout(),
            ring_timeout: default_ring_timeout(),
            alarm_timeout: default_alarm_timeout(),
            delay_dial: default_delay_dial(),
            out_of_service: false,
            connect: true,
        }
    }
}

/// A timer value in milliseconds; negatives fall back to the default.
pub(crate) fn timer_duration(value: i64, default_ms: u64) -> Duration {
    if value >= 0 {
        Duration::from_millis(value as u64)
    } else {
        Duration::from_millis(default_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AnalogLineConfig::default();
        assert!(!config.inband_dtmf);
        assert_eq!(config.echo_cancel, None);
        assert_eq!(config.call_setup, CallSetup::After);
        assert_eq!(config.callsetup_timeout, 2000);
        assert_eq!(config.ring_timeout, 10000);
        assert_eq!(config.alarm_timeout, 30000);
        assert_eq!(config.delay_dial, 2000);
        assert!(!config.out_of_service);
        assert!(config.connect);
    }

    #[test]
    fn negative_timers_fall_back_to_defaults() {
        assert_eq!(timer_duration(-1, 2000), Duration::from_millis(2000));
        assert_eq!(timer_duration(0, 2000), Duration::from_millis(0));
        assert_eq!(timer_duration(500, 2000), Duration::from_millis(500));
    }

    #[test]
    fn config_deserializes_from_documented_keys() {
        let config: AnalogLineConfig = serde_json::from_str(
            r#"{
                "dtmfinband": true,
                "echocancel": false,
                "callsetup": "before",
                "callsetup-timeout": -5,
                "ring-timeout": 12000,
                "out-of-service": true
            }"#,
        )
        .unwrap();
        assert!(config.inband_dtmf);
        assert_eq!(config.echo_cancel, Some(false));
        assert_eq!(config.call_setup, CallSetup::Before);
        assert_eq!(config.callsetup_timeout, -5);
        assert_eq!(config.ring_timeout, 12000);
        assert!(config.out_of_service);
        assert!(config.connect);
    }

    #[test]
    fn callsetup_words_parse() {
        assert_eq!("after".parse::<CallSetup>().unwrap(), CallSetup::After);
        assert_eq!("none".parse::<CallSetup>().unwrap(), CallSetup::None);
        assert!("sometimes".parse::<CallSetup>().is_err());
    }
}
