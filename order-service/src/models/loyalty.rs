//! Loyalty ledger entries and the tier table derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use super::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryType {
    Earn,
    Redeem,
    AdminAdjust,
}

impl LedgerEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryType::Earn => "EARN",
            LedgerEntryType::Redeem => "REDEEM",
            LedgerEntryType::AdminAdjust => "ADMIN_ADJUST",
        }
    }
}

impl TryFrom<String> for LedgerEntryType {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "EARN" => Ok(LedgerEntryType::Earn),
            "REDEEM" => Ok(LedgerEntryType::Redeem),
            "ADMIN_ADJUST" => Ok(LedgerEntryType::AdminAdjust),
            _ => Err(UnknownVariant::new("ledger entry type", value)),
        }
    }
}

/// Immutable ledger row. Positive points earn, negative points redeem.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LoyaltyLedgerEntry {
    pub id: Uuid,
    pub user_id: String,
    pub points: i64,
    #[sqlx(try_from = "String")]
    pub entry_type: LedgerEntryType,
    pub description: String,
    pub order_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

/// Loyalty tier, derived from lifetime earned points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "BAC")]
    Bac,
    #[serde(rename = "VANG")]
    Vang,
    #[serde(rename = "KIM_CUONG")]
    KimCuong,
}

impl Tier {
    pub fn for_points(total_earned: i64) -> Tier {
        if total_earned >= Tier::KimCuong.threshold() {
            Tier::KimCuong
        } else if total_earned >= Tier::Vang.threshold() {
            Tier::Vang
        } else {
            Tier::Bac
        }
    }

    /// Lifetime earned points needed to reach this tier.
    pub fn threshold(&self) -> i64 {
        match self {
            Tier::Bac => 0,
            Tier::Vang => 1_000,
            Tier::KimCuong => 5_000,
        }
    }

    /// Earning multiplier in tenths, so 15 means 1.5x.
    pub fn multiplier_tenths(&self) -> i64 {
        match self {
            Tier::Bac => 10,
            Tier::Vang => 15,
            Tier::KimCuong => 20,
        }
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier_tenths() as f64 / 10.0
    }

    /// `floor(base_points * multiplier)` in integer arithmetic.
    pub fn apply_multiplier(&self, base_points: i64) -> i64 {
        base_points.max(0) * self.multiplier_tenths() / 10
    }

    pub fn free_shipping(&self) -> bool {
        matches!(self, Tier::KimCuong)
    }

    pub fn next(&self) -> Option<Tier> {
        match self {
            Tier::Bac => Some(Tier::Vang),
            Tier::Vang => Some(Tier::KimCuong),
            Tier::KimCuong => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Tier::Bac => "Bac",
            Tier::Vang => "Vang",
            Tier::KimCuong => "Kim Cuong",
        }
    }
}

/// Balance folded from the ledger, with the derived tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoyaltyBalance {
    pub user_id: String,
    pub total_earned: i64,
    pub total_redeemed: i64,
    pub current_balance: i64,
    pub tier: Tier,
    pub tier_name: String,
    pub multiplier: f64,
    pub free_shipping: bool,
    pub next_tier: Option<Tier>,
    pub points_to_next_tier: Option<i64>,
}

impl LoyaltyBalance {
    pub fn from_totals(user_id: &str, total_earned: i64, total_redeemed: i64) -> Self {
        let tier = Tier::for_points(total_earned);
        let next_tier = tier.next();
        Self {
            user_id: user_id.to_string(),
            total_earned,
            total_redeemed,
            current_balance: total_earned - total_redeemed,
            tier,
            tier_name: tier.display_name().to_string(),
            multiplier: tier.multiplier(),
            free_shipping: tier.free_shipping(),
            next_tier,
            points_to_next_tier: next_tier.map(|t| t.threshold() - total_earned),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AdjustPointsRequest {
    pub points: i64,
    #[validate(length(min = 1, max = 500))]
    pub description: String,
}
