//! Futures rollover scheduling.
//!
//! A contract rolls on the term day of each month in its expiry cycle. Term
//! day rules follow the exchange convention strings carried on the symbol:
//! `nth_business_day_N` counts forward from the first business day of the
//! month, `nth_last_business_day_N` counts backward from the last. Business
//! days are weekdays; exchange holiday calendars are identified by name on
//! the symbol but not modelled here.

use chrono::{Datelike, Duration, NaiveDate, Weekday};

use tl_types::{Symbol, SymbolKind};

fn is_business_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn nth_business_day(year: i32, month: u32, n: u32) -> Option<NaiveDate> {
    let mut date = NaiveDate::from_ymd_opt(year, month, 1)?;
    let mut count = 0;
    while date.month() == month {
        if is_business_day(date) {
            count += 1;
            if count == n {
                return Some(date);
            }
        }
        date += Duration::days(1);
    }
    None
}

fn nth_last_business_day(year: i32, month: u32, n: u32) -> Option<NaiveDate> {
    let first_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let mut date = first_next - Duration::days(1);
    let mut count = 0;
    while date.month() == month {
        if is_business_day(date) {
            count += 1;
            if count == n {
                return Some(date);
            }
        }
        date -= Duration::days(1);
    }
    None
}

/// Resolve a term-day rule for a given month. `None` when the rule string
/// is malformed or the month is too short.
pub fn term_day(rule: &str, year: i32, month: u32) -> Option<NaiveDate> {
    if let Some(n) = rule.strip_prefix("nth_last_business_day_") {
        return nth_last_business_day(year, month, n.parse().ok()?);
    }
    if let Some(n) = rule.strip_prefix("nth_business_day_") {
        return nth_business_day(year, month, n.parse().ok()?);
    }
    None
}

/// Whether `date` is the rollover day for `symbol`'s front contract.
///
/// Non-futures never roll. A future rolls when the date falls in one of its
/// expiry-cycle months and matches the term-day rule for that month.
pub fn is_rollover_day(symbol: &Symbol, date: NaiveDate) -> bool {
    let SymbolKind::Future {
        expiry_months,
        term_day_rule,
        ..
    } = &symbol.kind
    else {
        return false;
    };

    if !expiry_months
        .iter()
        .any(|m| m.month_number() == date.month())
    {
        return false;
    }

    term_day(term_day_rule, date.year(), date.month()) == Some(date)
}
