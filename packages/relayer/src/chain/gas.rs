//! Gas pricing for destination transactions
//!
//! Both pricers scale the node's suggestion by the configured multiplier and
//! then clamp it to the configured ceiling.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{ChainError, FeeSource};

/// Price attached to a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasPrice {
    /// Single `gasPrice`
    Legacy(u128),
    /// EIP-1559 fee pair
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
}

impl GasPrice {
    /// Raise by `percent`, never above `cap`
    pub fn bumped(self, percent: u32, cap: Option<u128>) -> Self {
        let bump = |p: u128| clamp(p.saturating_mul(100 + percent as u128) / 100, cap);
        match self {
            GasPrice::Legacy(p) => GasPrice::Legacy(bump(p)),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let max_fee_per_gas = bump(max_fee_per_gas);
                GasPrice::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas: bump(max_priority_fee_per_gas).min(max_fee_per_gas),
                }
            }
        }
    }
}

/// Multiplier and ceiling applied to every suggestion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GasSettings {
    pub multiplier: f64,
    /// Upper bound in wei; `None` means uncapped
    pub max_gas_price: Option<u128>,
}

impl Default for GasSettings {
    fn default() -> Self {
        Self {
            multiplier: 1.0,
            max_gas_price: None,
        }
    }
}

impl GasSettings {
    /// Scale then cap
    pub fn apply(&self, price: u128) -> u128 {
        clamp(scale(price, self.multiplier), self.max_gas_price)
    }
}

fn scale(price: u128, multiplier: f64) -> u128 {
    (price as f64 * multiplier) as u128
}

fn clamp(price: u128, cap: Option<u128>) -> u128 {
    match cap {
        Some(max) => price.min(max),
        None => price,
    }
}

#[async_trait]
pub trait GasPricer: Send + Sync {
    async fn gas_price(&self) -> Result<GasPrice, ChainError>;
}

/// Legacy pricing from `eth_gasPrice`
pub struct StaticGasPricer {
    source: Arc<dyn FeeSource>,
    settings: GasSettings,
}

impl StaticGasPricer {
    pub fn new(source: Arc<dyn FeeSource>, settings: GasSettings) -> Self {
        Self { source, settings }
    }
}

#[async_trait]
impl GasPricer for StaticGasPricer {
    async fn gas_price(&self) -> Result<GasPrice, ChainError> {
        let suggested = self.source.suggested_gas_price().await?;
        let price = self.settings.apply(suggested);
        debug!(suggested, price, "Static gas price");
        Ok(GasPrice::Legacy(price))
    }
}

/// EIP-1559 pricing: `maxFee = multiplier * (2 * baseFee + tip)`
///
/// Falls back to a legacy price on chains that report no base fee.
pub struct LondonGasPricer {
    source: Arc<dyn FeeSource>,
    settings: GasSettings,
}

impl LondonGasPricer {
    pub fn new(source: Arc<dyn FeeSource>, settings: GasSettings) -> Self {
        Self { source, settings }
    }
}

/// Combine a base fee and tip under the configured multiplier and cap.
/// The multiplier applies to both the fee ceiling and the tip.
pub fn london_fees(base_fee: u128, tip: u128, settings: &GasSettings) -> GasPrice {
    let tip = scale(tip, settings.multiplier);
    let max_fee = scale(base_fee.saturating_mul(2), settings.multiplier).saturating_add(tip);
    let max_fee_per_gas = clamp(max_fee, settings.max_gas_price);
    // The cap may sit below base fee; the tip then shrinks to whatever is left
    let max_priority_fee_per_gas = tip
        .min(max_fee_per_gas.saturating_sub(base_fee))
        .min(max_fee_per_gas);
    GasPrice::Eip1559 {
        max_fee_per_gas,
        max_priority_fee_per_gas,
    }
}

#[async_trait]
impl GasPricer for LondonGasPricer {
    async fn gas_price(&self) -> Result<GasPrice, ChainError> {
        match self.source.base_fee().await? {
            Some(base_fee) => {
                let tip = self.source.suggested_priority_fee().await?;
                let price = london_fees(base_fee, tip, &self.settings);
                debug!(base_fee, tip, ?price, "London gas price");
                Ok(price)
            }
            None => {
                let suggested = self.source.suggested_gas_price().await?;
                Ok(GasPrice::Legacy(self.settings.apply(suggested)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixedFees;

    const GWEI: u128 = 1_000_000_000;

    #[test]
    fn test_multiplier_then_cap() {
        let settings = GasSettings {
            multiplier: 1.5,
            max_gas_price: Some(100 * GWEI),
        };
        assert_eq!(settings.apply(10 * GWEI), 15 * GWEI);
        assert_eq!(settings.apply(80 * GWEI), 100 * GWEI);
        assert_eq!(GasSettings::default().apply(7), 7);
    }

    #[test]
    fn test_london_fees_uncapped() {
        let price = london_fees(30 * GWEI, 2 * GWEI, &GasSettings::default());
        assert_eq!(
            price,
            GasPrice::Eip1559 {
                max_fee_per_gas: 62 * GWEI,
                max_priority_fee_per_gas: 2 * GWEI,
            }
        );
    }

    #[test]
    fn test_london_fees_scale_whole_price() {
        let settings = GasSettings {
            multiplier: 1.5,
            max_gas_price: None,
        };
        let price = london_fees(30 * GWEI, 2 * GWEI, &settings);
        assert_eq!(
            price,
            GasPrice::Eip1559 {
                max_fee_per_gas: 93 * GWEI,
                max_priority_fee_per_gas: 3 * GWEI,
            }
        );
    }

    #[test]
    fn test_london_fees_capped_below_base_fee() {
        let settings = GasSettings {
            multiplier: 1.0,
            max_gas_price: Some(20 * GWEI),
        };
        let price = london_fees(30 * GWEI, 2 * GWEI, &settings);
        assert_eq!(
            price,
            GasPrice::Eip1559 {
                max_fee_per_gas: 20 * GWEI,
                max_priority_fee_per_gas: 0,
            }
        );
    }

    #[test]
    fn test_london_fees_cap_trims_tip() {
        let settings = GasSettings {
            multiplier: 1.0,
            max_gas_price: Some(31 * GWEI),
        };
        let price = london_fees(30 * GWEI, 2 * GWEI, &settings);
        assert_eq!(
            price,
            GasPrice::Eip1559 {
                max_fee_per_gas: 31 * GWEI,
                max_priority_fee_per_gas: GWEI,
            }
        );
    }

    #[test]
    fn test_bump_respects_cap() {
        let legacy = GasPrice::Legacy(100).bumped(20, None);
        assert_eq!(legacy, GasPrice::Legacy(120));
        assert_eq!(GasPrice::Legacy(100).bumped(20, Some(110)), GasPrice::Legacy(110));

        let london = GasPrice::Eip1559 {
            max_fee_per_gas: 100,
            max_priority_fee_per_gas: 10,
        }
        .bumped(50, Some(120));
        assert_eq!(
            london,
            GasPrice::Eip1559 {
                max_fee_per_gas: 120,
                max_priority_fee_per_gas: 15,
            }
        );
    }

    #[tokio::test]
    async fn test_static_pricer() {
        let fees = Arc::new(FixedFees::legacy(10 * GWEI));
        let pricer = StaticGasPricer::new(
            fees,
            GasSettings {
                multiplier: 2.0,
                max_gas_price: Some(15 * GWEI),
            },
        );
        assert_eq!(pricer.gas_price().await.unwrap(), GasPrice::Legacy(15 * GWEI));
    }

    #[tokio::test]
    async fn test_london_pricer_falls_back_without_base_fee() {
        let fees = Arc::new(FixedFees::legacy(5 * GWEI));
        let pricer = LondonGasPricer::new(fees, GasSettings::default());
        assert_eq!(pricer.gas_price().await.unwrap(), GasPrice::Legacy(5 * GWEI));

        let fees = Arc::new(FixedFees::london(10 * GWEI, GWEI));
        let pricer = LondonGasPricer::new(fees, GasSettings::default());
        assert_eq!(
            pricer.gas_price().await.unwrap(),
            GasPrice::Eip1559 {
                max_fee_per_gas: 21 * GWEI,
                max_priority_fee_per_gas: GWEI,
            }
        );
    }
}
