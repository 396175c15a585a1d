//! 时间戳换算.
//!
//! 所有换算均用 i128 交叉相乘, 结果向零截断:
//! `new = ts * from.num * to.den / (from.den * to.num)`.

use std::cmp::Ordering;

use crate::error::{LiuError, LiuResult};
use crate::rational::Rational;

/// 将时间戳从一个时间基换算到另一个时间基 (截断)
pub fn rescale(ts: i64, from: Rational, to: Rational) -> LiuResult<i64> {
    if !from.is_valid() || !to.is_valid() {
        return Err(LiuError::InvalidArgument(format!(
            "无效时间基: {from} -> {to}"
        )));
    }
    if from == to {
        return Ok(ts);
    }
    let num = i128::from(ts) * i128::from(from.num) * i128::from(to.den);
    let den = i128::from(from.den) * i128::from(to.num);
    i64::try_from(num / den)
        .map_err(|_| LiuError::InvalidArgument(format!("时间戳换算溢出: {ts} ({from} -> {to})")))
}

/// 比较不同时间基下的两个时间戳
pub fn compare(a: i64, a_tb: Rational, b: i64, b_tb: Rational) -> Ordering {
    let lhs = i128::from(a) * i128::from(a_tb.num) * i128::from(b_tb.den);
    let rhs = i128::from(b) * i128::from(b_tb.num) * i128::from(a_tb.den);
    lhs.cmp(&rhs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_截断换算() {
        let tb = Rational::new(1, 44_100);
        assert_eq!(rescale(0, tb, Rational::MILLI).unwrap(), 0);
        assert_eq!(rescale(1024, tb, Rational::MILLI).unwrap(), 23);
        assert_eq!(rescale(2048, tb, Rational::MILLI).unwrap(), 46);
        assert_eq!(
            rescale(90_000, Rational::MPEG_90K, Rational::MILLI).unwrap(),
            1000
        );
    }

    #[test]
    fn test_timestamp_无效时间基() {
        assert!(rescale(1, Rational::UNDEFINED, Rational::MILLI).is_err());
        assert!(rescale(i64::MAX, Rational::MILLI, Rational::MPEG_90K).is_err());
    }

    #[test]
    fn test_timestamp_跨时间基比较() {
        assert_eq!(
            compare(1000, Rational::MILLI, 90_000, Rational::MPEG_90K),
            Ordering::Equal
        );
        assert_eq!(
            compare(999, Rational::MILLI, 90_000, Rational::MPEG_90K),
            Ordering::Less
        );
    }
}
