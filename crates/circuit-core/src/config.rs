//! Controller configuration.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::group::{strategy_word, AllocationStrategy, FALLBACK, ONLY_EVEN, ONLY_ODD};

/// Parity restriction applied on top of an allocation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyRestrict {
    Odd,
    Even,
    OddFallback,
    EvenFallback,
}

impl StrategyRestrict {
    /// Flag bits this restriction contributes to a strategy word.
    pub fn flags(&self) -> u32 {
        match self {
            StrategyRestrict::Odd => ONLY_ODD,
            StrategyRestrict::Even => ONLY_EVEN,
            StrategyRestrict::OddFallback => ONLY_ODD | FALLBACK,
            StrategyRestrict::EvenFallback => ONLY_EVEN | FALLBACK,
        }
    }
}

impl FromStr for StrategyRestrict {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "odd" => Ok(StrategyRestrict::Odd),
            "even" => Ok(StrategyRestrict::Even),
            "odd-fallback" => Ok(StrategyRestrict::OddFallback),
            "even-fallback" => Ok(StrategyRestrict::EvenFallback),
            other => Err(ConfigError::UnknownRestrict {
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for AllocationStrategy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "increment" => Ok(AllocationStrategy::Increment),
            "decrement" => Ok(AllocationStrategy::Decrement),
            "lowest" => Ok(AllocationStrategy::Lowest),
            "highest" => Ok(AllocationStrategy::Highest),
            "random" => Ok(AllocationStrategy::Random),
            other => Err(ConfigError::UnknownStrategy {
                value: other.to_string(),
            }),
        }
    }
}

/// Configuration consumed by [`CallControl`](crate::control::CallControl).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Allocation strategy applied to attached circuit groups.
    #[serde(default)]
    pub strategy: AllocationStrategy,

    /// Parity restriction; ignored when the strategy is `random`.
    #[serde(rename = "strategy-restrict", default)]
    pub strategy_restrict: Option<StrategyRestrict>,
}

impl ControlConfig {
    /// The packed strategy word for this configuration.
    pub fn strategy_word(&self) -> u32 {
        let mut flags = 0;
        if self.strategy != AllocationStrategy::Random {
            if let Some(restrict) = self.strategy_restrict {
                flags = restrict.flags();
            }
        }
        strategy_word(self.strategy, flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_strategy_is_increment() {
        let config = ControlConfig::default();
        assert_eq!(config.strategy, AllocationStrategy::Increment);
        assert_eq!(
            AllocationStrategy::from_word(config.strategy_word()),
            AllocationStrategy::Increment
        );
    }

    #[test]
    fn restrict_is_ignored_for_random() {
        let config = ControlConfig {
            strategy: AllocationStrategy::Random,
            strategy_restrict: Some(StrategyRestrict::EvenFallback),
        };
        let word = config.strategy_word();
        assert_eq!(word & (ONLY_EVEN | ONLY_ODD | FALLBACK), 0);
    }

    #[test]
    fn restrict_words_parse() {
        assert_eq!(
            "odd-fallback".parse::<StrategyRestrict>().unwrap(),
            StrategyRestrict::OddFallback
        );
        assert!("oddish".parse::<StrategyRestrict>().is_err());
        assert_eq!(
            "decrement".parse::<AllocationStrategy>().unwrap(),
            AllocationStrategy::Decrement
        );
        assert!("fastest".parse::<AllocationStrategy>().is_err());
    }

    #[test]
    fn config_deserializes_from_documented_keys() {
        let config: ControlConfig =
            serde_json::from_str(r#"{"strategy":"highest","strategy-restrict":"even-fallback"}"#)
                .unwrap();
        assert_eq!(config.strategy, AllocationStrategy::Highest);
        assert_eq!(config.strategy_restrict, Some(StrategyRestrict::EvenFallback));
        let word = config.strategy_word();
        assert_ne!(word & ONLY_EVEN, 0);
        assert_ne!(word & FALLBACK, 0);
    }
}
