//! Rate-card pricing.
//!
//! All functions are pure. A rate card lacking a weekly or monthly tier falls
//! back to a fixed daily equivalent: one week is priced as 7 days and one month
//! as 30 days, regardless of the calendar month the range actually covers.

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::models::{DateRange, PriceBreakdown, QuantumType, RateCard, Reservation};

pub const DAYS_PER_WEEK_FALLBACK: i64 = 7;
pub const DAYS_PER_MONTH_FALLBACK: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSource {
    Tier,
    DailyFallback,
}

/// Price of a single quantum and where it came from.
pub fn unit_rate(card: &RateCard, quantum: QuantumType) -> Result<(i64, RateSource)> {
    let fallback = |days: i64| {
        card.daily_rate_cents
            .checked_mul(days)
            .map(|rate| (rate, RateSource::DailyFallback))
            .ok_or_else(|| AppError::InvalidInput("daily fallback rate overflows".to_string()))
    };
    match quantum {
        QuantumType::Daily => Ok((card.daily_rate_cents, RateSource::Tier)),
        QuantumType::Weekly => match card.weekly_rate_cents {
            Some(rate) => Ok((rate, RateSource::Tier)),
            None => fallback(DAYS_PER_WEEK_FALLBACK),
        },
        QuantumType::Monthly => match card.monthly_rate_cents {
            Some(rate) => Ok((rate, RateSource::Tier)),
            None => fallback(DAYS_PER_MONTH_FALLBACK),
        },
    }
}

/// `quantity` quanta at the card's rate.
pub fn price(card: &RateCard, quantum: QuantumType, quantity: u32) -> Result<i64> {
    quantum.validate_quantity(quantity)?;
    let (rate, _) = unit_rate(card, quantum)?;
    rate.checked_mul(i64::from(quantity))
        .ok_or_else(|| AppError::InvalidInput("price overflows".to_string()))
}

/// Insurance add-on for `days` calendar days.
pub fn insurance(card: &RateCard, days: i64) -> Result<i64> {
    let per_day = card.insurance_per_day_cents.ok_or_else(|| {
        AppError::InvalidInput("insurance is not offered for this vehicle".to_string())
    })?;
    per_day
        .checked_mul(days)
        .ok_or_else(|| AppError::InvalidInput("insurance price overflows".to_string()))
}

#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub quantum: QuantumType,
    pub quantity: u32,
    pub base_cents: i64,
    pub insurance_cents: i64,
    pub total_cents: i64,
    pub rate_source: RateSource,
}

impl Quote {
    pub fn range(&self) -> DateRange {
        DateRange {
            start: self.start_date,
            end: self.end_date,
        }
    }
}

/// Prices `quantity` quanta starting at `start`, with optional insurance.
pub fn quote(
    card: &RateCard,
    quantum: QuantumType,
    quantity: u32,
    start: NaiveDate,
    with_insurance: bool,
) -> Result<Quote> {
    let base_cents = price(card, quantum, quantity)?;
    let end = quantum.end_date(start, quantity)?;
    let range = DateRange::new(start, end)?;
    let insurance_cents = if with_insurance {
        insurance(card, range.days())?
    } else {
        0
    };
    let (_, rate_source) = unit_rate(card, quantum)?;

    Ok(Quote {
        start_date: start,
        end_date: end,
        quantum,
        quantity,
        base_cents,
        insurance_cents,
        total_cents: checked_sum(&[base_cents, insurance_cents])?,
        rate_source,
    })
}

/// Reprices a whole reservation (original quantum plus every extension) on a
/// different rate card, keeping its dates.
pub fn reprice(card: &RateCard, reservation: &Reservation) -> Result<PriceBreakdown> {
    let base_cents = price(card, reservation.quantum, reservation.quantity)?;
    let original_days = reservation
        .quantum
        .end_date(reservation.start_date, reservation.quantity)
        .map(|end| (end - reservation.start_date).num_days())?;
    let insurance_cents = if reservation.insurance {
        insurance(card, original_days)?
    } else {
        0
    };

    let mut extension_cents = 0i64;
    for ext in &reservation.extensions {
        let mut cost = price(card, reservation.quantum, ext.quantity)?;
        if reservation.insurance {
            let days = (ext.new_end_date - ext.previous_end_date).num_days();
            cost = checked_sum(&[cost, insurance(card, days)?])?;
        }
        extension_cents = checked_sum(&[extension_cents, cost])?;
    }

    Ok(PriceBreakdown {
        base_cents,
        insurance_cents,
        extension_cents,
        total_cents: checked_sum(&[base_cents, insurance_cents, extension_cents])?,
    })
}

pub fn checked_sum(values: &[i64]) -> Result<i64> {
    values.iter().try_fold(0i64, |acc, v| {
        acc.checked_add(*v)
            .ok_or_else(|| AppError::InvalidInput("amount overflows".to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(daily: i64, weekly: Option<i64>, monthly: Option<i64>) -> RateCard {
        RateCard {
            daily_rate_cents: daily,
            weekly_rate_cents: weekly,
            monthly_rate_cents: monthly,
            insurance_per_day_cents: None,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_daily_is_quantity_times_rate() {
        let c = card(5000, Some(30000), None);
        for n in [1u32, 3, 10, 365] {
            assert_eq!(price(&c, QuantumType::Daily, n).unwrap(), 5000 * i64::from(n));
        }
    }

    #[test]
    fn test_weekly_uses_tier_when_present() {
        let c = card(5000, Some(30000), None);
        assert_eq!(price(&c, QuantumType::Weekly, 2).unwrap(), 60000);
        assert_eq!(unit_rate(&c, QuantumType::Weekly).unwrap().1, RateSource::Tier);
    }

    #[test]
    fn test_weekly_falls_back_to_seven_days() {
        let c = card(5000, None, None);
        assert_eq!(price(&c, QuantumType::Weekly, 2).unwrap(), 2 * 7 * 5000);
        assert_eq!(
            unit_rate(&c, QuantumType::Weekly).unwrap().1,
            RateSource::DailyFallback
        );
    }

    #[test]
    fn test_monthly_falls_back_to_thirty_days() {
        let c = card(5000, Some(30000), None);
        assert_eq!(price(&c, QuantumType::Monthly, 1).unwrap(), 30 * 5000);
        let tiered = card(5000, None, Some(100000));
        assert_eq!(price(&tiered, QuantumType::Monthly, 3).unwrap(), 300000);
    }

    #[test]
    fn test_quantity_must_be_in_bounds() {
        let c = card(5000, None, None);
        assert!(matches!(
            price(&c, QuantumType::Daily, 0),
            Err(AppError::InvalidRange { .. })
        ));
        assert!(price(&c, QuantumType::Monthly, 13).is_err());
    }

    #[test]
    fn test_quote_itemizes_insurance() {
        let c = RateCard {
            insurance_per_day_cents: Some(1200),
            ..card(5000, Some(30000), None)
        };
        let q = quote(&c, QuantumType::Daily, 3, date(2024, 6, 1), true).unwrap();
        assert_eq!(q.base_cents, 15000);
        assert_eq!(q.insurance_cents, 3600);
        assert_eq!(q.total_cents, 18600);
        assert_eq!(q.end_date, date(2024, 6, 4));

        let without = quote(&c, QuantumType::Daily, 3, date(2024, 6, 1), false).unwrap();
        assert_eq!(without.insurance_cents, 0);
        assert_eq!(without.total_cents, 15000);
    }

    #[test]
    fn test_insurance_requires_rate() {
        let c = card(5000, None, None);
        let result = quote(&c, QuantumType::Daily, 3, date(2024, 6, 1), true);
        assert!(matches!(result, Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn test_insurance_covers_calendar_days_of_a_month() {
        let c = RateCard {
            insurance_per_day_cents: Some(100),
            ..card(5000, None, None)
        };
        let q = quote(&c, QuantumType::Monthly, 1, date(2024, 2, 1), true).unwrap();
        assert_eq!(q.end_date, date(2024, 3, 1));
        assert_eq!(q.insurance_cents, 29 * 100);
        assert_eq!(q.base_cents, 30 * 5000);
    }

    #[test]
    fn test_fallback_rate_overflow_is_an_error() {
        let c = card(i64::MAX / 10, None, None);
        assert!(unit_rate(&c, QuantumType::Weekly).is_ok());
        assert!(matches!(
            unit_rate(&c, QuantumType::Monthly),
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            price(&c, QuantumType::Monthly, 1),
            Err(AppError::InvalidInput(_))
        ));
        assert!(quote(&c, QuantumType::Monthly, 1, date(2024, 1, 1), false).is_err());
    }

    #[test]
    fn test_price_overflow_is_an_error() {
        let c = card(i64::MAX / 2, None, None);
        assert!(price(&c, QuantumType::Daily, 3).is_err());
    }
}
