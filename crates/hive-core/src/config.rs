use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::allotment::{default_tiers, validate_tiers, AllotmentTier};
use crate::{
    HiveError, INITIAL_TRANSFERABLE, MAX_LAYER, PENDING_WINDOW_SECS, RELEASE_COOLDOWN_SECS,
    RELEASE_TRANCHE, STARTER_LOCKED,
};

/// Serde adapter for u128 ↔ TOML: serialize as string, deserialize from string or integer.
/// TOML crate doesn't natively support u128, so we round-trip through strings.
pub mod u128_toml {
    use super::*;

    pub fn serialize<S: Serializer>(val: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&val.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        use serde::de::{self, Visitor};
        struct U128Visitor;

        impl<'de> Visitor<'de> for U128Visitor {
            type Value = u128;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a u128 as a string or integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<u128, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<u128, E> {
                Ok(v as u128)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<u128, E> {
                if v >= 0 {
                    Ok(v as u128)
                } else {
                    Err(E::custom("negative value for u128"))
                }
            }
        }

        d.deserialize_any(U128Visitor)
    }
}

/// Whether the sweep releases locked tranches itself or only reports availability.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePolicy {
    #[default]
    Manual,
    Auto,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReferralGate {
    pub layer: u8,
    pub min_direct_referrals: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RewardsConfig {
    pub pending_window_secs: u64,
    /// Extra direct-referral requirement per reward layer.
    pub referral_gates: Vec<ReferralGate>,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            pending_window_secs: PENDING_WINDOW_SECS,
            referral_gates: vec![ReferralGate {
                layer: 2,
                min_direct_referrals: 3,
            }],
        }
    }
}

impl RewardsConfig {
    /// Direct referrals a recipient needs for a reward at `layer` (0 = no gate).
    pub fn min_direct_referrals(&self, layer: u8) -> u32 {
        self.referral_gates
            .iter()
            .filter(|g| g.layer == layer)
            .map(|g| g.min_direct_referrals)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    pub release_cooldown_secs: u64,
    #[serde(with = "u128_toml")]
    pub release_tranche: u128,
    #[serde(with = "u128_toml")]
    pub initial_transferable: u128,
    #[serde(with = "u128_toml")]
    pub starter_locked: u128,
    pub tiers: Vec<AllotmentTier>,
    pub release_policy: ReleasePolicy,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            release_cooldown_secs: RELEASE_COOLDOWN_SECS,
            release_tranche: RELEASE_TRANCHE,
            initial_transferable: INITIAL_TRANSFERABLE,
            starter_locked: STARTER_LOCKED,
            tiers: default_tiers(),
            release_policy: ReleasePolicy::Manual,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PlacementConfig {
    /// Phase-1 restarts allowed after a slot conflict before surfacing `SlotConflict`.
    pub max_retries: u32,
    /// First backoff delay; doubles on every retry.
    pub backoff_base_ms: u64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_ms: 10,
        }
    }
}

/// Tunables for the placement, reward and ledger engines.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub rewards: RewardsConfig,
    pub ledger: LedgerConfig,
    pub placement: PlacementConfig,
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, HiveError> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| HiveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HiveError> {
        if self.rewards.pending_window_secs == 0 {
            return Err(HiveError::Config(
                "rewards.pending_window_secs must be > 0".to_string(),
            ));
        }
        for gate in &self.rewards.referral_gates {
            if gate.layer == 0 || gate.layer > MAX_LAYER {
                return Err(HiveError::Config(format!(
                    "referral gate layer {} outside 1..={}",
                    gate.layer, MAX_LAYER
                )));
            }
        }
        if self.ledger.release_tranche == 0 {
            return Err(HiveError::Config(
                "ledger.release_tranche must be > 0".to_string(),
            ));
        }
        if self.ledger.release_cooldown_secs == 0 {
            return Err(HiveError::Config(
                "ledger.release_cooldown_secs must be > 0".to_string(),
            ));
        }
        validate_tiers(&self.ledger.tiers)
            .map_err(|e| HiveError::Config(format!("ledger.tiers: {}", e)))?;
        if self.placement.max_retries == 0 {
            return Err(HiveError::Config(
                "placement.max_retries must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.rewards.min_direct_referrals(2), 3);
        assert_eq!(cfg.rewards.min_direct_referrals(1), 0);
        assert_eq!(cfg.rewards.min_direct_referrals(5), 0);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            [rewards]
            pending_window_secs = 3600
            referral_gates = [{ layer = 2, min_direct_referrals = 3 }, { layer = 3, min_direct_referrals = 5 }]

            [ledger]
            release_tranche = "250"
            release_policy = "auto"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.rewards.pending_window_secs, 3600);
        assert_eq!(cfg.rewards.min_direct_referrals(3), 5);
        assert_eq!(cfg.ledger.release_tranche, 250);
        assert_eq!(cfg.ledger.release_policy, ReleasePolicy::Auto);
        assert_eq!(cfg.ledger.starter_locked, STARTER_LOCKED);
        assert_eq!(cfg.placement.max_retries, 5);
    }

    #[test]
    fn test_integer_u128_accepted() {
        let cfg = EngineConfig::from_toml_str("[ledger]\nstarter_locked = 9000\n").unwrap();
        assert_eq!(cfg.ledger.starter_locked, 9000);
    }

    #[test]
    fn test_invalid_gate_layer_rejected() {
        let err = EngineConfig::from_toml_str(
            "[rewards]\nreferral_gates = [{ layer = 20, min_direct_referrals = 1 }]\n",
        )
        .unwrap_err();
        assert!(matches!(err, HiveError::Config(_)));
    }

    #[test]
    fn test_zero_tranche_rejected() {
        assert!(EngineConfig::from_toml_str("[ledger]\nrelease_tranche = 0\n").is_err());
    }

    #[test]
    fn test_duplicate_gates_take_max() {
        let cfg = RewardsConfig {
            pending_window_secs: 10,
            referral_gates: vec![
                ReferralGate {
                    layer: 2,
                    min_direct_referrals: 3,
                },
                ReferralGate {
                    layer: 2,
                    min_direct_referrals: 4,
                },
            ],
        };
        assert_eq!(cfg.min_direct_referrals(2), 4);
        assert_eq!(cfg.min_direct_referrals(3), 0);
    }
}
