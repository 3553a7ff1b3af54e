//! Quote composition: totals, deposit, discount precedence, rounding.
//!
//! Everything here is pure and deterministic: the same inputs always
//! produce the same cents, so preview requests can hit it at arbitrary
//! frequency and commit-time recomputation can't drift from the preview.

use chrono::NaiveDate;

use crate::models::{AddOn, PromoCode, Service};

pub const DISCOUNT_TYPE_PERCENT: &str = "percent";
pub const DISCOUNT_TYPE_FIXED: &str = "fixed";

/// The single discount source applied to a quote. An explicit promo code
/// always wins over the automatic ambassador percentage; they never stack.
#[derive(Debug, Clone, Copy)]
pub enum Discount<'a> {
    None,
    Promo(&'a PromoCode),
    Ambassador(i64),
}

/// A deterministic price/duration quote. Ephemeral, recomputed server-side
/// at commit time: never trusted from the client.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub service_name: String,
    pub total_minutes: i64,
    pub total_cents: i64,
    pub deposit_cents: i64,
    pub discount_percent: Option<i64>,
    pub discount_cents: i64,
    pub remaining_cents: i64,
    pub tip_cents: i64,
}

/// Round-half-up percentage of an amount in integer cents, applied once,
/// never to intermediate per-add-on terms.
fn percent_of(amount_cents: i64, percent: i64) -> i64 {
    (amount_cents * percent + 50).div_euclid(100)
}

pub fn compute_quote(service: &Service, add_ons: &[AddOn], discount: Discount) -> Quote {
    let total_cents = service.price_cents + add_ons.iter().map(|a| a.price_cents).sum::<i64>();
    let total_minutes = service.duration_min + add_ons.iter().map(|a| a.duration_min).sum::<i64>();
    let deposit_cents = service.deposit_cents;

    let (discount_percent, discount_cents) = match discount {
        Discount::None => (None, 0),
        Discount::Promo(promo) if promo.discount_type == DISCOUNT_TYPE_FIXED => {
            (None, promo.discount_value.max(0))
        }
        Discount::Promo(promo) => {
            let pct = promo.discount_value.clamp(0, 100);
            (Some(pct), percent_of(total_cents, pct))
        }
        Discount::Ambassador(pct) => {
            let pct = pct.clamp(0, 100);
            (Some(pct), percent_of(total_cents, pct))
        }
    };

    // Discount comes off the balance remaining after the deposit, never off
    // the deposit itself.
    let remaining_cents = (total_cents - deposit_cents - discount_cents).max(0);

    Quote {
        service_name: service.name.clone(),
        total_minutes,
        total_cents,
        deposit_cents,
        discount_percent,
        discount_cents,
        remaining_cents,
        tip_cents: 0,
    }
}

/// Discount precedence: an explicit promo code beats the automatic
/// ambassador percentage; at most one source ever applies.
pub fn choose_discount<'a>(
    promo: Option<&'a PromoCode>,
    ambassador_percent: Option<i64>,
) -> Discount<'a> {
    match (promo, ambassador_percent) {
        (Some(p), _) => Discount::Promo(p),
        (None, Some(pct)) => Discount::Ambassador(pct),
        (None, None) => Discount::None,
    }
}

/// Why a promo code can't be applied right now, or `None` if it's usable.
/// Expiry is date-granular: a code is valid through its `expires_at` day.
pub fn promo_rejection(promo: &PromoCode, today: NaiveDate) -> Option<&'static str> {
    if !promo.is_active {
        return Some("promo code is no longer active");
    }
    if let Some(expires) = &promo.expires_at {
        match NaiveDate::parse_from_str(expires, "%Y-%m-%d") {
            Ok(d) if today > d => return Some("promo code has expired"),
            Ok(_) => {}
            // Unparseable expiry fails safe to expired.
            Err(_) => return Some("promo code has expired"),
        }
    }
    if let Some(max) = promo.max_uses {
        if promo.times_used >= max {
            return Some("promo code has no uses remaining");
        }
    }
    None
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn service(price: i64, deposit: i64, duration: i64) -> Service {
        Service {
            id: 1,
            name: "Silk Press".into(),
            description: String::new(),
            price_cents: price,
            deposit_cents: deposit,
            duration_min: duration,
            points_earned: 0,
            is_active: true,
            sort_order: 0,
        }
    }

    fn add_on(price: i64, duration: i64) -> AddOn {
        AddOn {
            id: 1,
            name: "Deep Conditioning Treatment".into(),
            price_cents: price,
            duration_min: duration,
            is_active: true,
        }
    }

    fn percent_promo(pct: i64) -> PromoCode {
        PromoCode {
            id: 1,
            code: "TEST".into(),
            discount_type: DISCOUNT_TYPE_PERCENT.into(),
            discount_value: pct,
            expires_at: None,
            max_uses: None,
            times_used: 0,
            is_active: true,
        }
    }

    fn fixed_promo(cents: i64) -> PromoCode {
        PromoCode {
            discount_type: DISCOUNT_TYPE_FIXED.into(),
            discount_value: cents,
            ..percent_promo(0)
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::parse_from_str("2030-06-03", "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_no_promo_example() {
        // $100 service, $30 deposit, 60 min; $20 add-on, 15 min.
        let svc = service(10000, 3000, 60);
        let addons = vec![add_on(2000, 15)];
        let q = compute_quote(&svc, &addons, Discount::None);
        assert_eq!(q.total_cents, 12000);
        assert_eq!(q.total_minutes, 75);
        assert_eq!(q.deposit_cents, 3000);
        assert_eq!(q.discount_cents, 0);
        assert_eq!(q.remaining_cents, 9000);
        assert_eq!(q.tip_cents, 0);
    }

    #[test]
    fn test_quote_is_deterministic() {
        let svc = service(10000, 3000, 60);
        let addons = vec![add_on(2000, 15), add_on(2500, 20)];
        let promo = percent_promo(10);
        let a = compute_quote(&svc, &addons, Discount::Promo(&promo));
        let b = compute_quote(&svc, &addons, Discount::Promo(&promo));
        assert_eq!(a, b);
    }

    #[test]
    fn test_percent_discount_off_total_subtracted_from_remaining() {
        let svc = service(10000, 3000, 60);
        let promo = percent_promo(10);
        let q = compute_quote(&svc, &[], Discount::Promo(&promo));
        assert_eq!(q.discount_cents, 1000); // 10% of total, not of remaining
        assert_eq!(q.deposit_cents, 3000); // deposit untouched
        assert_eq!(q.remaining_cents, 6000);
        assert_eq!(q.discount_percent, Some(10));
    }

    #[test]
    fn test_rounding_half_up_applied_once_at_the_end() {
        // total 999 + 2 × 333 = 1665; 5% = 83.25 → 83.
        let svc = service(999, 0, 30);
        let addons = vec![add_on(333, 5), add_on(333, 5)];
        let promo = percent_promo(5);
        let q = compute_quote(&svc, &addons, Discount::Promo(&promo));
        assert_eq!(q.discount_cents, 83);

        // 1250 at 15% = 187.5 → rounds up to 188.
        let svc = service(1250, 0, 30);
        let promo = percent_promo(15);
        let q = compute_quote(&svc, &[], Discount::Promo(&promo));
        assert_eq!(q.discount_cents, 188);
    }

    #[test]
    fn test_fixed_promo() {
        let svc = service(10000, 3000, 60);
        let promo = fixed_promo(1500);
        let q = compute_quote(&svc, &[], Discount::Promo(&promo));
        assert_eq!(q.discount_percent, None);
        assert_eq!(q.discount_cents, 1500);
        assert_eq!(q.remaining_cents, 5500);
    }

    #[test]
    fn test_remaining_floors_at_zero() {
        let svc = service(5000, 3000, 60);
        let promo = fixed_promo(9999);
        let q = compute_quote(&svc, &[], Discount::Promo(&promo));
        assert_eq!(q.remaining_cents, 0);
    }

    #[test]
    fn test_ambassador_discount() {
        let svc = service(10000, 3000, 60);
        let q = compute_quote(&svc, &[], Discount::Ambassador(10));
        assert_eq!(q.discount_percent, Some(10));
        assert_eq!(q.discount_cents, 1000);
        assert_eq!(q.remaining_cents, 6000);
    }

    #[test]
    fn test_promo_beats_ambassador_never_stacks() {
        let svc = service(10000, 0, 60);
        let promo = percent_promo(20);

        // Both eligible → promo wins outright.
        let d = choose_discount(Some(&promo), Some(10));
        let q = compute_quote(&svc, &[], d);
        assert_eq!(q.discount_percent, Some(20));
        assert_eq!(q.discount_cents, 2000); // 20%, not 20% + 10%

        // No promo → ambassador percentage applies.
        let d = choose_discount(None, Some(10));
        let q = compute_quote(&svc, &[], d);
        assert_eq!(q.discount_cents, 1000);

        // Neither → no discount.
        let d = choose_discount(None, None);
        let q = compute_quote(&svc, &[], d);
        assert_eq!(q.discount_cents, 0);
        assert_eq!(q.discount_percent, None);
    }

    #[test]
    fn test_promo_rejection_rules() {
        let mut promo = percent_promo(10);
        assert_eq!(promo_rejection(&promo, today()), None);

        promo.is_active = false;
        assert!(promo_rejection(&promo, today()).is_some());
        promo.is_active = true;

        promo.expires_at = Some("2030-06-02".into());
        assert!(promo_rejection(&promo, today()).is_some());
        promo.expires_at = Some("2030-06-03".into());
        assert_eq!(promo_rejection(&promo, today()), None); // valid through expiry day
        promo.expires_at = Some("not-a-date".into());
        assert!(promo_rejection(&promo, today()).is_some()); // fail safe
        promo.expires_at = None;

        promo.max_uses = Some(5);
        promo.times_used = 5;
        assert!(promo_rejection(&promo, today()).is_some());
        promo.times_used = 4;
        assert_eq!(promo_rejection(&promo, today()), None);
    }
}
