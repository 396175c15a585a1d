//! 有理数类型, 用于表示时间基.
//!
//! 时间基 1/90000 表示 90kHz 时钟, 1/1000 表示毫秒.

use std::fmt;

/// 有理数, 由分子和分母组成
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    /// 分子
    pub num: i32,
    /// 分母
    pub den: i32,
}

impl Rational {
    /// 创建新的有理数
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// 未定义 (分母为 0)
    pub const UNDEFINED: Self = Self { num: 0, den: 0 };

    /// 毫秒时间基, FLV 使用
    pub const MILLI: Self = Self { num: 1, den: 1_000 };

    /// 90kHz 时间基, MPEG-TS 使用
    pub const MPEG_90K: Self = Self {
        num: 1,
        den: 90_000,
    };

    /// 判断是否有效 (分子分母均为正)
    pub const fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// 由 "每 tick 纳秒数" 构造时间基, 例如 Matroska 的 TimecodeScale
    pub fn from_nanos(ns_per_tick: u64) -> Self {
        let g = gcd(ns_per_tick, 1_000_000_000);
        if g == 0 {
            return Self::UNDEFINED;
        }
        let num = ns_per_tick / g;
        let den = 1_000_000_000 / g;
        match (i32::try_from(num), i32::try_from(den)) {
            (Ok(num), Ok(den)) => Self { num, den },
            _ => Self::UNDEFINED,
        }
    }

    pub fn to_f64(self) -> f64 {
        if self.den == 0 {
            return f64::NAN;
        }
        f64::from(self.num) / f64::from(self.den)
    }

    /// 约分
    pub fn reduce(self) -> Self {
        if self.den == 0 {
            return self;
        }
        let g = gcd(
            u64::from(self.num.unsigned_abs()),
            u64::from(self.den.unsigned_abs()),
        );
        if g == 0 {
            return self;
        }
        let g = g as i32;
        let sign = if self.den < 0 { -1 } else { 1 };
        Self {
            num: sign * self.num / g,
            den: sign * self.den / g,
        }
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl From<(i32, i32)> for Rational {
    fn from((num, den): (i32, i32)) -> Self {
        Self { num, den }
    }
}

/// 最大公约数 (欧几里得算法)
fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}
