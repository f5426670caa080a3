//! `ByteQty`, a byte quantity that parses and prints in human units.
//
// The closest crate on crates.io is `bytesize`, which confuses KiB with KB
// and is unmaintained.  `humansize` only does printing.  Rolling our own
// also lets us base the type on `i64`, which is what tracker arithmetic
// uses throughout (negative values mean "no limit", and a metric-driven
// root can transiently drift negative).

#![allow(clippy::comparison_to_empty)] // unit == "" etc. is much clearer

use derive_more::{From, Into};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt::{self, Display};
use std::str::FromStr;

use InvalidByteQty as IBQ;

/// Byte quantity, as used for tracker limits and consumption values.
///
/// Like `i64` but `FromStr` and `Display`s in a friendlier, less precise
/// way.
///
/// Parses from (with or without the internal space):
///  * `<amount>` (implicitly, bytes)
///  * `<amount> B`
///  * `<amount> KiB`/`MiB`/`GiB`/`TiB` (binary, 1024-based units)
///  * `<amount> KB`/`MB`/`GB`/`TB` (decimal, 1000-based units)
///
/// Displays to approximately 3 significant figures, preferring binary
/// (1024-based) multipliers.  Negative quantities display with a leading
/// sign; they cannot be parsed.
#[derive(Debug, Clone, Copy, Hash, Default, Eq, PartialEq, Ord, PartialOrd)] //
#[derive(From, Into, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "ByteQtySerde")]
#[allow(clippy::exhaustive_structs)] // this is a behavioural newtype wrapper
pub struct ByteQty(pub i64);

/// Error parsing (or deserialising) a [`ByteQty`]
#[derive(Error, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum InvalidByteQty {
    /// Value bigger than `i64::MAX`
    #[error("size/quantity outside supported range (max is {} B)", i64::MAX)]
    Overflow,
    /// Unknown unit
    #[error("size/quantity specified unknown unit; supported are {}", SupportedUnits)]
    UnknownUnit,
    /// Bad syntax
    #[error("size/quantity specified string in bad syntax")]
    BadSyntax,
    /// Negative value
    #[error("size/quantity cannot be negative")]
    Negative,
    /// NaN
    #[error("size/quantity cannot be obtained from a floating point NaN")]
    NaN,
    /// Bad value type
    #[error("bad type for size/quantity (only numbers, and strings to parse, are supported)")]
    BadValue,
}

//---------- units (definitions) ----------

/// Units used when displaying a [`ByteQty`], and recognised when parsing
const DISPLAY_UNITS: &[(&str, i64)] = &[
    ("B", 1),
    ("KiB", 1024),
    ("MiB", 1024 * 1024),
    ("GiB", 1024 * 1024 * 1024),
    ("TiB", 1024 * 1024 * 1024 * 1024),
];

/// Units that are (only) recognised when parsing a [`ByteQty`]
const PARSE_UNITS: &[(&str, i64)] = &[
    ("", 1),
    ("KB", 1000),
    ("MB", 1000 * 1000),
    ("GB", 1000 * 1000 * 1000),
    ("TB", 1000 * 1000 * 1000 * 1000),
];

/// Units that are used when parsing *and* when printing
const ALL_UNITS: &[&[(&str, i64)]] = &[
    //
    DISPLAY_UNITS,
    PARSE_UNITS,
];

//---------- inherent methods ----------

impl ByteQty {
    /// Maximum for the type
    pub const MAX: ByteQty = ByteQty(i64::MAX);

    /// Return the value as a plain number, an `i64`
    ///
    /// Provided so call sites don't need to write an opaque `.0`
    /// everywhere, even though that would be fine.
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

//---------- printing ----------

impl Display for ByteQty {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0 < 0 {
            write!(f, "-")?;
        }
        let v = self.0.unsigned_abs() as f64;

        // Find the first unit big enough that the mantissa is <999.5,
        // ie where it won't print as 4 digits before the point.
        // Or, failing that, use the last (largest) unit.
        let (unit, mantissa) = DISPLAY_UNITS
            .iter()
            .copied()
            .map(|(unit, multiplier)| (unit, v / multiplier as f64))
            .find_or_last(|(_, mantissa)| *mantissa < 999.5)
            .expect("DISPLAY_UNITS is empty?!");

        // Aim for about 3 significant figures.
        let after_decimal = if unit == "B" {
            0
        } else if mantissa < 9.995 {
            2
        } else if mantissa < 99.95 {
            1
        } else {
            0
        };

        write!(f, "{mantissa:.*} {unit}", after_decimal)
    }
}

//---------- incoming conversions ----------

impl TryFrom<u64> for ByteQty {
    type Error = InvalidByteQty;
    fn try_from(v: u64) -> Result<ByteQty, IBQ> {
        let v = i64::try_from(v).map_err(|_| IBQ::Overflow)?;
        Ok(ByteQty(v))
    }
}

impl TryFrom<f64> for ByteQty {
    type Error = InvalidByteQty;
    fn try_from(f: f64) -> Result<ByteQty, IBQ> {
        if f.is_nan() {
            Err(IBQ::NaN)
        } else if f > (i64::MAX as f64) {
            Err(IBQ::Overflow)
        } else if f >= 0. {
            Ok(ByteQty(f as i64))
        } else {
            Err(IBQ::Negative)
        }
    }
}

/// Helper for deserializing [`ByteQty`]
#[derive(Deserialize, Clone)]
#[serde(untagged)]
enum ByteQtySerde {
    /// `u64`
    U(u64),
    /// `String`
    S(String),
    /// `f64`
    F(f64),
    /// Other things
    Bad(serde::de::IgnoredAny),
}

impl TryFrom<ByteQtySerde> for ByteQty {
    type Error = InvalidByteQty;
    fn try_from(qs: ByteQtySerde) -> Result<ByteQty, IBQ> {
        match qs {
            ByteQtySerde::S(s) => s.parse(),
            ByteQtySerde::U(u) => u.try_into(),
            ByteQtySerde::F(f) => f.try_into(),
            ByteQtySerde::Bad(_) => Err(IBQ::BadValue),
        }
    }
}

//---------- FromStr ----------

impl FromStr for ByteQty {
    type Err = InvalidByteQty;
    fn from_str(s: &str) -> Result<Self, IBQ> {
        let s = s.trim();

        let last_digit = s
            .rfind(|c: char| c.is_ascii_digit())
            .ok_or(IBQ::BadSyntax)?;

        // last_digit points to an ASCII digit so +1 is right to skip it
        let (mantissa, unit) = s.split_at(last_digit + 1);

        let unit = unit.trim_start(); // remove any whitespace in the middle

        // defer unknown unit errors until we've done the rest of the parsing
        let multiplier: Result<i64, _> = ALL_UNITS
            .iter()
            .copied()
            .flatten()
            .find(|(s, _)| *s == unit)
            .map(|(_, m)| *m)
            .ok_or(IBQ::UnknownUnit);

        // Try via u64 first (byte-precise where possible), then via f64
        // (so fractional amounts like "1.5 GiB" work).
        if let Ok::<u64, _>(mantissa) = mantissa.parse() {
            let multiplier = u64::try_from(multiplier?).expect("negative unit multiplier?!");
            mantissa
                .checked_mul(multiplier)
                .ok_or(IBQ::Overflow)?
                .try_into()
        } else if let Ok::<f64, _>(mantissa) = mantissa.parse() {
            let value = mantissa * (multiplier? as f64);
            value.try_into()
        } else {
            Err(IBQ::BadSyntax)
        }
    }
}

/// Helper to format the list of supported units into `IBQ::UnknownUnit`
struct SupportedUnits;

impl Display for SupportedUnits {
    #[allow(unstable_name_collisions)] // Itertools::intersperse vs std's;  rust-lang/rust#48919
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for s in ALL_UNITS
            .iter()
            .copied()
            .flatten()
            .copied()
            .map(|(unit, _multiplier)| unit)
            .filter(|unit| !unit.is_empty())
            .intersperse("/")
        {
            Display::fmt(s, f)?;
        }
        Ok(())
    }
}
