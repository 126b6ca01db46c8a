//! Core domain enums and the string-encoded feature value format
//!
//! These types are deliberately free of persistence concerns: the billing
//! crate stores them as TEXT columns and converts through `as_str` /
//! `FromStr` at the query boundary.

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime, Time, Weekday};

/// Error returned when a stored enum string does not match any variant.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum! {
    /// Kind of capability a feature grants.
    FeatureType {
        Limit => "limit",
        Metered => "metered",
        Boolean => "boolean",
    }
}

impl FeatureType {
    /// Only limit and metered features accumulate usage.
    pub fn is_consumable(&self) -> bool {
        matches!(self, FeatureType::Limit | FeatureType::Metered)
    }
}

string_enum! {
    /// Usage reset cadence for metered/limited features.
    ResetPeriod {
        Daily => "daily",
        Weekly => "weekly",
        Monthly => "monthly",
        Yearly => "yearly",
        None => "none",
    }
}

impl ResetPeriod {
    /// Start of the next cycle after `now`, or `None` for non-resetting
    /// features. Boundaries are calendar-aligned in UTC: start of next
    /// day / ISO week (Monday) / month / year.
    pub fn next_boundary(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        let now = now.to_offset(time::UtcOffset::UTC);
        let date = now.date();
        let next = match self {
            ResetPeriod::Daily => date.next_day()?,
            ResetPeriod::Weekly => {
                let until_monday = match date.weekday() {
                    Weekday::Monday => 7,
                    other => 7 - other.number_days_from_monday() as i64,
                };
                date.checked_add(Duration::days(until_monday))?
            }
            ResetPeriod::Monthly => first_of_month_after(date)?,
            ResetPeriod::Yearly => Date::from_calendar_date(date.year() + 1, Month::January, 1).ok()?,
            ResetPeriod::None => return None,
        };
        Some(OffsetDateTime::new_utc(next, Time::MIDNIGHT))
    }
}

fn first_of_month_after(date: Date) -> Option<Date> {
    let (year, month) = match date.month() {
        Month::December => (date.year() + 1, Month::January),
        m => (date.year(), m.next()),
    };
    Date::from_calendar_date(year, month, 1).ok()
}

string_enum! {
    /// Billing interval of a plan price or recurring add-on.
    BillingInterval {
        Day => "day",
        Week => "week",
        Month => "month",
        Year => "year",
    }
}

impl BillingInterval {
    /// Advance `from` by `count` intervals. Month/year arithmetic clamps
    /// the day of month (Jan 31 + 1 month = Feb 28/29).
    pub fn advance(&self, from: OffsetDateTime, count: i32) -> OffsetDateTime {
        match self {
            BillingInterval::Day => from + Duration::days(count as i64),
            BillingInterval::Week => from + Duration::weeks(count as i64),
            BillingInterval::Month => add_months(from, count),
            BillingInterval::Year => add_months(from, count * 12),
        }
    }
}

fn add_months(from: OffsetDateTime, months: i32) -> OffsetDateTime {
    let date = from.date();
    let zero_based = date.year() * 12 + (date.month() as i32 - 1) + months;
    let year = zero_based.div_euclid(12);
    let month_number = zero_based.rem_euclid(12) as u8 + 1;
    let month = match Month::try_from(month_number) {
        Ok(m) => m,
        Err(_) => return from,
    };
    let day = date.day().min(month.length(year));
    match Date::from_calendar_date(year, month, day) {
        Ok(d) => from.replace_date(d),
        Err(_) => from,
    }
}

string_enum! {
    /// Derived subscription status. Never authoritative when stored; see
    /// the lifecycle manager for the derivation precedence.
    SubscriptionStatus {
        Trialing => "trialing",
        PastDue => "past_due",
        Expired => "expired",
        Canceled => "canceled",
        Active => "active",
    }
}

impl SubscriptionStatus {
    /// Whether the tenant currently has paid access.
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trialing | SubscriptionStatus::Active | SubscriptionStatus::PastDue
        )
    }
}

string_enum! {
    /// Checkout lifecycle state.
    CheckoutStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
        Expired => "expired",
        Cancelled => "cancelled",
    }
}

impl CheckoutStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CheckoutStatus::Completed
                | CheckoutStatus::Failed
                | CheckoutStatus::Expired
                | CheckoutStatus::Cancelled
        )
    }

    /// Token generation is only legal before a terminal state is reached.
    pub fn can_generate_token(&self) -> bool {
        matches!(self, CheckoutStatus::Pending | CheckoutStatus::Processing)
    }

    /// A checkout can be cancelled while it is still in flight.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, CheckoutStatus::Pending | CheckoutStatus::Processing)
    }
}

string_enum! {
    /// What a checkout is buying.
    CheckoutType {
        New => "new",
        Renew => "renew",
        Upgrade => "upgrade",
        Downgrade => "downgrade",
        Addon => "addon",
        AddonRenew => "addon_renew",
    }
}

impl CheckoutType {
    pub fn is_addon(&self) -> bool {
        matches!(self, CheckoutType::Addon | CheckoutType::AddonRenew)
    }
}

string_enum! {
    /// How an add-on contributes to entitlement resolution.
    AddonType {
        Increment => "increment",
        Boolean => "boolean",
        Unlimited => "unlimited",
    }
}

string_enum! {
    /// Payment lifecycle state.
    PaymentStatus {
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
        Refunded => "refunded",
    }
}

string_enum! {
    /// When a plan change takes money and effect.
    ProrationPolicy {
        Immediate => "immediate",
        EndOfPeriod => "end_of_period",
    }
}

/// A feature value as stored in the catalog: a decimal string, the
/// unlimited sentinel, or a boolean-ish `"0"`/`"1"`.
///
/// The sentinel must be checked before any numeric cast, so parsing is
/// the only place raw strings are touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureValue {
    Unlimited,
    Number(i64),
}

impl FeatureValue {
    /// Parse the stored string encoding. `"-1"` and `"unlimited"` are the
    /// unlimited sentinels; anything else must be a base-10 integer.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("unlimited") {
            return Some(FeatureValue::Unlimited);
        }
        match raw.parse::<i64>() {
            Ok(-1) => Some(FeatureValue::Unlimited),
            Ok(n) if n >= 0 => Some(FeatureValue::Number(n)),
            _ => None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, FeatureValue::Unlimited)
    }

    /// Boolean reading: unlimited and any non-zero number grant access.
    pub fn as_bool(&self) -> bool {
        match self {
            FeatureValue::Unlimited => true,
            FeatureValue::Number(n) => *n != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_feature_value_parse() {
        assert_eq!(FeatureValue::parse("10"), Some(FeatureValue::Number(10)));
        assert_eq!(FeatureValue::parse("0"), Some(FeatureValue::Number(0)));
        assert_eq!(FeatureValue::parse("-1"), Some(FeatureValue::Unlimited));
        assert_eq!(FeatureValue::parse("unlimited"), Some(FeatureValue::Unlimited));
        assert_eq!(FeatureValue::parse("Unlimited"), Some(FeatureValue::Unlimited));
        assert_eq!(FeatureValue::parse(" 5 "), Some(FeatureValue::Number(5)));
        assert_eq!(FeatureValue::parse("-2"), None);
        assert_eq!(FeatureValue::parse("abc"), None);
    }

    #[test]
    fn test_feature_value_as_bool() {
        assert!(FeatureValue::Unlimited.as_bool());
        assert!(FeatureValue::Number(1).as_bool());
        assert!(!FeatureValue::Number(0).as_bool());
    }

    #[test]
    fn test_enum_round_trip() {
        assert_eq!("metered".parse::<FeatureType>().unwrap(), FeatureType::Metered);
        assert_eq!(CheckoutType::AddonRenew.as_str(), "addon_renew");
        assert_eq!("end_of_period".parse::<ProrationPolicy>().unwrap(), ProrationPolicy::EndOfPeriod);
        assert!("bogus".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn test_checkout_status_terminality() {
        assert!(!CheckoutStatus::Pending.is_terminal());
        assert!(!CheckoutStatus::Processing.is_terminal());
        assert!(CheckoutStatus::Completed.is_terminal());
        assert!(CheckoutStatus::Failed.is_terminal());
        assert!(CheckoutStatus::Expired.is_terminal());
        assert!(CheckoutStatus::Cancelled.is_terminal());
        assert!(CheckoutStatus::Pending.can_generate_token());
        assert!(!CheckoutStatus::Completed.can_generate_token());
    }

    #[test]
    fn test_interval_advance_months_clamps_day() {
        let jan31 = datetime!(2026-01-31 12:00 UTC);
        let feb = BillingInterval::Month.advance(jan31, 1);
        assert_eq!(feb.date(), time::macros::date!(2026-02-28));
        // leap year
        let jan31_leap = datetime!(2028-01-31 12:00 UTC);
        let feb_leap = BillingInterval::Month.advance(jan31_leap, 1);
        assert_eq!(feb_leap.date(), time::macros::date!(2028-02-29));
    }

    #[test]
    fn test_interval_advance_year_and_week() {
        let start = datetime!(2026-03-15 00:00 UTC);
        assert_eq!(
            BillingInterval::Year.advance(start, 1).date(),
            time::macros::date!(2027-03-15)
        );
        assert_eq!(
            BillingInterval::Week.advance(start, 2).date(),
            time::macros::date!(2026-03-29)
        );
        assert_eq!(
            BillingInterval::Day.advance(start, 30).date(),
            time::macros::date!(2026-04-14)
        );
    }

    #[test]
    fn test_reset_boundary_daily() {
        let now = datetime!(2026-06-10 15:30 UTC);
        assert_eq!(
            ResetPeriod::Daily.next_boundary(now),
            Some(datetime!(2026-06-11 00:00 UTC))
        );
    }

    #[test]
    fn test_reset_boundary_weekly_from_midweek_and_monday() {
        // 2026-06-10 is a Wednesday
        let wednesday = datetime!(2026-06-10 09:00 UTC);
        assert_eq!(
            ResetPeriod::Weekly.next_boundary(wednesday),
            Some(datetime!(2026-06-15 00:00 UTC))
        );
        // from a Monday, the boundary is the following Monday (strictly future)
        let monday = datetime!(2026-06-15 00:00 UTC);
        assert_eq!(
            ResetPeriod::Weekly.next_boundary(monday),
            Some(datetime!(2026-06-22 00:00 UTC))
        );
    }

    #[test]
    fn test_reset_boundary_monthly_yearly_none() {
        let now = datetime!(2026-12-31 23:59 UTC);
        assert_eq!(
            ResetPeriod::Monthly.next_boundary(now),
            Some(datetime!(2027-01-01 00:00 UTC))
        );
        assert_eq!(
            ResetPeriod::Yearly.next_boundary(now),
            Some(datetime!(2027-01-01 00:00 UTC))
        );
        assert_eq!(ResetPeriod::None.next_boundary(now), None);
    }

    #[test]
    fn test_status_grants_access() {
        assert!(SubscriptionStatus::Active.grants_access());
        assert!(SubscriptionStatus::Trialing.grants_access());
        assert!(SubscriptionStatus::PastDue.grants_access());
        assert!(!SubscriptionStatus::Expired.grants_access());
        assert!(!SubscriptionStatus::Canceled.grants_access());
    }
}
