//! Generalization and masking primitives
//!
//! From least to most protective: generalization (reduce precision),
//! masking (keep a hint of shape), removal. Removal is not a function here;
//! the release transform simply omits the field.

/// Ages at or above this are reported as a single open bucket
const AGE_OPEN_BUCKET: u64 = 90;

/// How a string value is masked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskStyle<'a> {
    /// Replace with a fixed placeholder
    Fixed(&'a str),
    /// Replace every character
    PerCharacter(char),
    /// Keep the first N characters
    PreservePrefix(usize, char),
    /// Keep the last N characters
    PreserveSuffix(usize, char),
}

/// Mask `value` according to `style`.
///
/// ```
/// use consent_ledger::packaging::{mask, MaskStyle};
///
/// assert_eq!(mask("secret", MaskStyle::PerCharacter('*')), "******");
/// assert_eq!(mask("Oakland", MaskStyle::PreservePrefix(1, '*')), "O******");
/// ```
pub fn mask(value: &str, style: MaskStyle<'_>) -> String {
    match style {
        MaskStyle::Fixed(placeholder) => placeholder.to_string(),
        MaskStyle::PerCharacter(c) => c.to_string().repeat(value.chars().count()),
        MaskStyle::PreservePrefix(n, c) => {
            let total = value.chars().count();
            let kept: String = value.chars().take(n).collect();
            format!("{kept}{}", c.to_string().repeat(total.saturating_sub(n)))
        }
        MaskStyle::PreserveSuffix(n, c) => {
            let total = value.chars().count();
            let kept: String = value.chars().skip(total.saturating_sub(n)).collect();
            format!("{}{kept}", c.to_string().repeat(total.saturating_sub(n)))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePrecision {
    Year,
    Quarter,
    Month,
    Day,
}

/// Truncate a calendar date. `month` is 1-12.
pub fn truncate_date(year: i32, month: u32, day: u32, precision: DatePrecision) -> String {
    match precision {
        DatePrecision::Year => format!("{year}"),
        DatePrecision::Quarter => format!("{year}-Q{}", (month.clamp(1, 12) - 1) / 3 + 1),
        DatePrecision::Month => format!("{year}-{month:02}"),
        DatePrecision::Day => format!("{year}-{month:02}-{day:02}"),
    }
}

/// Bucket an age, e.g. `47` with size 5 gives `"45-49"`. Ages 90 and over
/// collapse into `"90+"`.
pub fn generalize_age(age: u64, bucket_size: u64) -> String {
    if age >= AGE_OPEN_BUCKET {
        return format!("{AGE_OPEN_BUCKET}+");
    }
    let bucket_size = bucket_size.max(1);
    let start = (age / bucket_size) * bucket_size;
    let end = (start + bucket_size - 1).min(AGE_OPEN_BUCKET - 1);
    format!("{start}-{end}")
}

/// Keep the first `preserve` characters of a 5-character ZIP code.
pub fn generalize_zip(zip: &str, preserve: usize) -> String {
    let preserve = preserve.min(5);
    let kept: String = zip.chars().take(preserve).collect();
    format!("{kept}{}", "*".repeat(5 - preserve))
}

/// Bucket a non-negative number, e.g. `75000` with size 10000 gives
/// `"70000-79999"`.
pub fn generalize_numeric(value: u64, bucket_size: u64) -> String {
    let bucket_size = bucket_size.max(1);
    let start = (value / bucket_size) * bucket_size;
    format!("{start}-{}", start.saturating_add(bucket_size - 1))
}

/// Round a coordinate to `decimals` places (1 place is roughly 11 km).
pub fn round_coordinate(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}
