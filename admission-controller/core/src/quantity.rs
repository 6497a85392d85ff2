//! Kubernetes resource quantities.
//!
//! Quantities are held as signed milli-units, which is sufficient for every
//! resource a quota tracks (CPU in millicores, memory and storage in bytes,
//! object counts). Values finer than a milli-unit round up.

use openshift_admission_k8s_api as k8s;
use std::{
    fmt,
    ops::{Add, AddAssign, Neg, Sub, SubAssign},
    str::FromStr,
};
use thiserror::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity {
    milli: i128,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("quantity is empty")]
    Empty,

    #[error("quantity {0:?} has an invalid number")]
    InvalidNumber(String),

    #[error("quantity {0:?} has an unknown suffix")]
    InvalidSuffix(String),

    #[error("quantity {0:?} is out of range")]
    Overflow(String),
}

const MAX_POW10: i32 = 30;

// === impl Quantity ===

impl Quantity {
    pub const ZERO: Quantity = Quantity { milli: 0 };

    pub const fn from_milli(milli: i128) -> Self {
        Self { milli }
    }

    pub const fn from_units(units: i64) -> Self {
        Self {
            milli: units as i128 * 1000,
        }
    }

    pub const fn milli_value(&self) -> i128 {
        self.milli
    }

    pub fn is_zero(&self) -> bool {
        self.milli == 0
    }

    pub fn is_negative(&self) -> bool {
        self.milli < 0
    }

    pub fn max(self, other: Self) -> Self {
        if other.milli > self.milli {
            other
        } else {
            self
        }
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }

        let (negative, rest) = match s.as_bytes()[0] {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };

        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, suffix) = rest.split_at(num_end);

        let (whole, frac) = match number.split_once('.') {
            Some((w, f)) => (w, f),
            None => (number, ""),
        };
        if (whole.is_empty() && frac.is_empty()) || frac.contains('.') {
            return Err(QuantityError::InvalidNumber(s.to_string()));
        }

        let digits = format!("{whole}{frac}");
        let mantissa = digits
            .parse::<i128>()
            .map_err(|_| QuantityError::Overflow(s.to_string()))?;

        let (binary_shift, exp10) = parse_suffix(suffix)
            .ok_or_else(|| QuantityError::InvalidSuffix(s.to_string()))?;

        // Milli-units add three decimal places.
        let pow10 = i32::try_from(frac.len())
            .ok()
            .and_then(|frac_len| exp10.checked_add(3)?.checked_sub(frac_len))
            .ok_or_else(|| QuantityError::Overflow(s.to_string()))?;
        if pow10 > MAX_POW10 {
            return Err(QuantityError::Overflow(s.to_string()));
        }

        let scaled = mantissa
            .checked_mul(1i128 << binary_shift)
            .ok_or_else(|| QuantityError::Overflow(s.to_string()))?;

        let milli = if pow10 >= 0 {
            scaled
                .checked_mul(10i128.pow(pow10 as u32))
                .ok_or_else(|| QuantityError::Overflow(s.to_string()))?
        } else if pow10 < -MAX_POW10 {
            i128::from(scaled != 0)
        } else {
            let div = 10i128.pow((-pow10) as u32);
            (scaled + div - 1) / div
        };

        Ok(Self {
            milli: if negative { -milli } else { milli },
        })
    }
}

/// Returns the binary shift and decimal exponent denoted by a suffix.
fn parse_suffix(suffix: &str) -> Option<(u32, i32)> {
    let parsed = match suffix {
        "" => (0, 0),
        "n" => (0, -9),
        "u" => (0, -6),
        "m" => (0, -3),
        "k" => (0, 3),
        "M" => (0, 6),
        "G" => (0, 9),
        "T" => (0, 12),
        "P" => (0, 15),
        "E" => (0, 18),
        "Ki" => (10, 0),
        "Mi" => (20, 0),
        "Gi" => (30, 0),
        "Ti" => (40, 0),
        "Pi" => (50, 0),
        "Ei" => (60, 0),
        exp => {
            let exp = exp.strip_prefix('e').or_else(|| exp.strip_prefix('E'))?;
            (0, exp.parse::<i32>().ok()?)
        }
    };
    Some(parsed)
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.milli % 1000 == 0 {
            write!(f, "{}", self.milli / 1000)
        } else {
            write!(f, "{}m", self.milli)
        }
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            milli: self.milli.saturating_add(rhs.milli),
        }
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Quantity {
    type Output = Quantity;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            milli: self.milli.saturating_sub(rhs.milli),
        }
    }
}

impl SubAssign for Quantity {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Neg for Quantity {
    type Output = Quantity;

    fn neg(self) -> Self::Output {
        Self { milli: -self.milli }
    }
}

impl std::iter::Sum for Quantity {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl TryFrom<&k8s::Quantity> for Quantity {
    type Error = QuantityError;

    fn try_from(q: &k8s::Quantity) -> Result<Self, Self::Error> {
        q.0.parse()
    }
}

impl From<Quantity> for k8s::Quantity {
    fn from(q: Quantity) -> Self {
        k8s::Quantity(q.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        s.parse().unwrap_or_else(|e| panic!("{s}: {e}"))
    }

    #[test]
    fn parses_suffixes() {
        for (input, milli) in [
            ("0", 0),
            ("1", 1_000),
            ("500m", 500),
            ("1.5", 1_500),
            ("0.1", 100),
            ("2k", 2_000_000),
            ("1Ki", 1_024_000),
            ("1Mi", 1_048_576_000),
            ("1Gi", 1_073_741_824_000),
            ("1G", 1_000_000_000_000),
            ("1e3", 1_000_000),
            ("1E-3", 1),
            ("-2", -2_000),
            ("+3", 3_000),
            (".5", 500),
        ] {
            assert_eq!(q(input).milli_value(), milli, "{input}");
        }
    }

    #[test]
    fn sub_milli_values_round_up() {
        assert_eq!(q("1n").milli_value(), 1);
        assert_eq!(q("1500u").milli_value(), 2);
        assert_eq!(q("0.0001").milli_value(), 1);
        assert_eq!(q("0n").milli_value(), 0);
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!("".parse::<Quantity>(), Err(QuantityError::Empty));
        assert!(matches!(
            "abc".parse::<Quantity>(),
            Err(QuantityError::InvalidNumber(_))
        ));
        assert!(matches!(
            "1.2.3".parse::<Quantity>(),
            Err(QuantityError::InvalidSuffix(_)) | Err(QuantityError::InvalidNumber(_))
        ));
        assert!(matches!(
            "5Xi".parse::<Quantity>(),
            Err(QuantityError::InvalidSuffix(_))
        ));
        assert!(matches!(
            "1e40".parse::<Quantity>(),
            Err(QuantityError::Overflow(_))
        ));
    }

    #[test]
    fn extreme_exponents_do_not_overflow() {
        assert!(matches!(
            "1e2147483647".parse::<Quantity>(),
            Err(QuantityError::Overflow(_))
        ));
        assert!(matches!(
            "1.2345e-2147483648".parse::<Quantity>(),
            Err(QuantityError::Overflow(_))
        ));
        assert_eq!(q("1e-2147483648").milli_value(), 1);
        assert_eq!(q("125e-2147483645").milli_value(), 1);
        assert_eq!(q("0e-2147483648").milli_value(), 0);
    }

    #[test]
    fn formats_canonically() {
        assert_eq!(q("2").to_string(), "2");
        assert_eq!(q("1500m").to_string(), "1500m");
        assert_eq!(q("1Ki").to_string(), "1024");
        assert_eq!((q("1") + q("250m")).to_string(), "1250m");
    }

    #[test]
    fn compares_across_units() {
        assert!(q("1Gi") > q("1G"));
        assert!(q("999m") < q("1"));
        assert_eq!(q("1000m"), q("1"));
        assert_eq!(q("2") - q("500m"), q("1.5"));
    }
}
