// Ride Pricing
//
// Pricing and promotion engine for ride orders: a rule catalog kept in sync with
// Postgres, eligibility filtering, promo code resolution, rule combination, fare
// calculation, usage accounting and the order fare binder that drives fare
// finalization through the ride order lifecycle.

/// Copy every present (`Some`) field of a typed patch onto its target
///
/// `apply_present!(target, patch; a, b, c)` expands to one
/// `if let Some(v) = patch.a { target.a = v; }` per listed field.
macro_rules! apply_present {
    ($target:expr, $patch:expr; $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $patch.$field {
                $target.$field = value;
            }
        )+
    };
}

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod memory;
pub mod orders;
pub mod pricing;

pub use config::Settings;
pub use error::ErrorKind;
