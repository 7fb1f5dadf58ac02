//! Finding dates in logbook text without an LLM.
//!
//! Used when enhancement is skipped, or when the LLM didn't report a date.
//! Dates are normalized to `YYYY-MM-DD`.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::{Captures, Regex};

/// Month names and the abbreviations we see in handwritten logs.
const MONTH: &str = r"(jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)";

/// Day-of-month with an optional ordinal suffix.
const DAY: &str = r"(\d{1,2})(?:st|nd|rd|th)?";

/// The forms we recognise, paired with how to read their captures.
static PATTERNS: LazyLock<Vec<(Regex, DateForm)>> = LazyLock::new(|| {
    let pattern = |re: String| Regex::new(&re).expect("failed to compile date regex");
    vec![
        (
            pattern(r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b".to_owned()),
            DateForm::Iso,
        ),
        (
            pattern(format!(r"(?i)\b{DAY}\s+(?:of\s+)?{MONTH}\.?,?\s+(\d{{4}})\b")),
            DateForm::DayMonthYear,
        ),
        (
            pattern(format!(r"(?i)\b{MONTH}\.?\s+{DAY},?\s+(\d{{4}})\b")),
            DateForm::MonthDayYear,
        ),
        (
            pattern(r"\b(\d{1,2})/(\d{1,2})/(\d{4}|\d{2})\b".to_owned()),
            DateForm::Numeric,
        ),
    ]
});

/// How to interpret the captures of a date pattern.
#[derive(Clone, Copy, Debug)]
enum DateForm {
    /// `1933-01-14`
    Iso,
    /// `14 January 1933`
    DayMonthYear,
    /// `January 14, 1933`, `Jan. 14th 1933`
    MonthDayYear,
    /// `1/14/33`, US order.
    Numeric,
}

impl DateForm {
    /// Convert captures to a date, if they describe a real one.
    fn to_date(self, caps: &Captures<'_>) -> Option<NaiveDate> {
        let num = |idx: usize| caps.get(idx)?.as_str().parse::<u32>().ok();
        let (year, month, day) = match self {
            DateForm::Iso => (num(1)?, num(2)?, num(3)?),
            DateForm::DayMonthYear => (num(3)?, month_number(caps.get(2)?.as_str())?, num(1)?),
            DateForm::MonthDayYear => (num(3)?, month_number(caps.get(1)?.as_str())?, num(2)?),
            DateForm::Numeric => (expand_year(num(3)?), num(1)?, num(2)?),
        };
        NaiveDate::from_ymd_opt(i32::try_from(year).ok()?, month, day)
    }
}

/// Two-digit years in these logbooks are always 19xx.
fn expand_year(year: u32) -> u32 {
    if year < 100 { 1900 + year } else { year }
}

/// Map a month name or abbreviation to 1-12.
fn month_number(name: &str) -> Option<u32> {
    let prefix = name.get(..3)?.to_ascii_lowercase();
    let month = match prefix.as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// Find the first valid date in `text`, formatted as `YYYY-MM-DD`.
pub fn find_date(text: &str) -> Option<String> {
    PATTERNS
        .iter()
        .flat_map(|(re, form)| {
            re.captures_iter(text).filter_map(move |caps| {
                let start = caps.get(0)?.start();
                Some((start, form.to_date(&caps)?))
            })
        })
        .min_by_key(|(start, _)| *start)
        .map(|(_, date)| date.format("%Y-%m-%d").to_string())
}
