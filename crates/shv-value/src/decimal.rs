use std::fmt;

/// Fixed-point decimal number as `mantissa * 10^exponent`.
///
/// Equality and ordering compare the numeric value, not the representation:
/// `Decimal::new(2230, -1)` equals `Decimal::new(223, 0)`. Both codecs carry
/// the representation as-is.
#[derive(Clone, Copy, Debug)]
pub struct Decimal {
    mantissa: i64,
    exponent: i32,
}

impl Decimal {
    pub fn new(mantissa: i64, exponent: i32) -> Self {
        Self { mantissa, exponent }
    }

    pub fn mantissa(&self) -> i64 {
        self.mantissa
    }

    pub fn exponent(&self) -> i32 {
        self.exponent
    }

    /// Strip trailing decimal zeros from the mantissa.
    fn normalized(&self) -> (i64, i32) {
        if self.mantissa == 0 {
            return (0, 0);
        }
        let mut m = self.mantissa;
        let mut e = self.exponent;
        while m % 10 == 0 {
            m /= 10;
            e += 1;
        }
        (m, e)
    }

    pub fn to_f64(&self) -> f64 {
        self.mantissa as f64 * 10f64.powi(self.exponent)
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for Decimal {}

impl fmt::Display for Decimal {
    /// Decimal or scientific notation, following the same placement rule the
    /// reference implementation inherits from its decimal library: plain
    /// digits when the exponent is non-positive and the value is not too
    /// small, `E` notation otherwise.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let neg = self.mantissa < 0;
        let digits = self.mantissa.unsigned_abs().to_string();
        let ndigits = digits.len() as i32;
        let leftdigits = self.exponent + ndigits;

        let (dotplace, exppart) = if self.exponent <= 0 && leftdigits > -6 {
            (leftdigits, String::new())
        } else {
            (1, format!("E{:+}", leftdigits - 1))
        };

        let body = if dotplace <= 0 {
            format!("0.{}{}", "0".repeat(-dotplace as usize), digits)
        } else if dotplace >= ndigits {
            format!("{}{}", digits, "0".repeat((dotplace - ndigits) as usize))
        } else {
            let (int, frac) = digits.split_at(dotplace as usize);
            format!("{int}.{frac}")
        };

        write!(f, "{}{}{}", if neg { "-" } else { "" }, body, exppart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_plain() {
        assert_eq!(Decimal::new(23, -1).to_string(), "2.3");
        assert_eq!(Decimal::new(-12, -5).to_string(), "-0.00012");
        assert_eq!(Decimal::new(2230, -1).to_string(), "223.0");
        assert_eq!(Decimal::new(123, 0).to_string(), "123");
        assert_eq!(Decimal::new(0, 0).to_string(), "0");
    }

    #[test]
    fn display_scientific() {
        assert_eq!(Decimal::new(3, 2).to_string(), "3E+2");
        assert_eq!(Decimal::new(123, -9).to_string(), "1.23E-7");
        assert_eq!(Decimal::new(-1234567890, 1).to_string(), "-1.234567890E+10");
    }

    #[test]
    fn numeric_equality() {
        assert_eq!(Decimal::new(2230, -1), Decimal::new(223, 0));
        assert_eq!(Decimal::new(0, 5), Decimal::new(0, -3));
        assert_ne!(Decimal::new(223, 0), Decimal::new(2231, -1));
    }
}
