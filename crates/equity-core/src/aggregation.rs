//! Read-side folds over the equity ledger.
//!
//! Both views are pure functions of ledger entries plus equity settings. They never fail on
//! an empty ledger or a missing setting: rows are simply absent, and ownership is `None`
//! when no denominator is configured.

use crate::ledger::LedgerEntry;
use crate::types::{BusinessId, EquitySetting, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Ownership expressed exactly in basis points (hundredths of a percent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub basis_points: u64,
    /// Two-decimal percentage, e.g. `"10.00"`.
    pub percent: String,
}

impl Ownership {
    /// `units / total_units`, rounded half-up to the nearest basis point.
    /// Undefined (`None`) when the total is zero.
    pub fn compute(units: u64, total_units: u64) -> Option<Self> {
        if total_units == 0 {
            return None;
        }
        let numerator = units as u128 * 10_000 * 2 + total_units as u128;
        let denominator = total_units as u128 * 2;
        let basis_points = u64::try_from(numerator / denominator).unwrap_or(u64::MAX);
        Some(Self {
            basis_points,
            percent: format!("{}.{:02}", basis_points / 100, basis_points % 100),
        })
    }
}

impl fmt::Display for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.percent)
    }
}

/// Row ordering requested by the caller of a cap table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapTableOrder {
    /// Largest holders first; ties broken by holder id.
    #[default]
    Units,
    /// By holder id.
    Holder,
}

impl CapTableOrder {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "units" => Some(Self::Units),
            "holder" => Some(Self::Holder),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapTableRow {
    pub holder_user_id: UserId,
    pub units: u64,
    pub ownership: Option<Ownership>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapTable {
    pub business_id: BusinessId,
    /// Configured denominator, if any.
    pub total_units: Option<u64>,
    /// Sum of all granted units for the business.
    pub granted_units: u64,
    /// Grants exceed the configured total. Percentages then add up to more than 100%.
    pub over_allocated: bool,
    pub holders: Vec<CapTableRow>,
}

impl CapTable {
    pub fn holder(&self, holder_user_id: UserId) -> Option<&CapTableRow> {
        self.holders
            .iter()
            .find(|row| row.holder_user_id == holder_user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioRow {
    pub business_id: BusinessId,
    pub units: u64,
    pub total_units: Option<u64>,
    pub ownership: Option<Ownership>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Portfolio {
    pub recipient_user_id: UserId,
    pub total_units_held: u64,
    pub businesses: Vec<PortfolioRow>,
}

impl Portfolio {
    pub fn business(&self, business_id: BusinessId) -> Option<&PortfolioRow> {
        self.businesses
            .iter()
            .find(|row| row.business_id == business_id)
    }
}

/// Fold `entries` into a cap table for `business_id`.
///
/// Entries for other businesses are ignored, so callers may pass an unfiltered ledger.
pub fn build_cap_table(
    business_id: BusinessId,
    entries: &[LedgerEntry],
    setting: Option<&EquitySetting>,
    order: CapTableOrder,
) -> CapTable {
    let total_units = setting
        .filter(|s| s.business_id == business_id)
        .map(|s| s.total_units);

    let mut by_holder: BTreeMap<UserId, u64> = BTreeMap::new();
    for entry in entries.iter().filter(|e| e.business_id == business_id) {
        let held = by_holder.entry(entry.recipient_user_id).or_default();
        *held = held.saturating_add(entry.units);
    }

    let granted_units = saturating_total(by_holder.values());
    let mut holders = by_holder
        .into_iter()
        .map(|(holder_user_id, units)| CapTableRow {
            holder_user_id,
            units,
            ownership: total_units.and_then(|total| Ownership::compute(units, total)),
        })
        .collect::<Vec<_>>();

    if order == CapTableOrder::Units {
        // Stable sort keeps holder-id order among equal holdings.
        holders.sort_by(|a, b| b.units.cmp(&a.units));
    }

    CapTable {
        business_id,
        total_units,
        granted_units,
        over_allocated: total_units.map_or(false, |total| granted_units > total),
        holders,
    }
}

/// Fold `entries` into the portfolio of `recipient_user_id`, one row per business.
pub fn build_portfolio(
    recipient_user_id: UserId,
    entries: &[LedgerEntry],
    settings: &[EquitySetting],
) -> Portfolio {
    let totals: HashMap<BusinessId, u64> = settings
        .iter()
        .map(|s| (s.business_id, s.total_units))
        .collect();

    let mut by_business: BTreeMap<BusinessId, u64> = BTreeMap::new();
    for entry in entries
        .iter()
        .filter(|e| e.recipient_user_id == recipient_user_id)
    {
        let held = by_business.entry(entry.business_id).or_default();
        *held = held.saturating_add(entry.units);
    }

    let total_units_held = saturating_total(by_business.values());
    let businesses = by_business
        .into_iter()
        .map(|(business_id, units)| {
            let total_units = totals.get(&business_id).copied();
            PortfolioRow {
                business_id,
                units,
                total_units,
                ownership: total_units.and_then(|total| Ownership::compute(units, total)),
            }
        })
        .collect();

    Portfolio {
        recipient_user_id,
        total_units_held,
        businesses,
    }
}

fn saturating_total<'a>(units: impl Iterator<Item = &'a u64>) -> u64 {
    units.fold(0u64, |acc, u| acc.saturating_add(*u))
}
