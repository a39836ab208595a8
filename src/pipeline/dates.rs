//! Status date extraction, conditioned on the final label.
//!
//! | label            | kinds                                               |
//! |------------------|-----------------------------------------------------|
//! | rejection        | rejection (body dates, else received), response     |
//! | interview_invite | interview (body dates), response                    |
//! | job_application  | follow_up (dates in sentences with a follow-up cue) |
//!
//! Relative and year-less expressions resolve against the received time.
//! All times are UTC.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use regex::{Captures, Regex};

use crate::pipeline::patterns::PatternStore;
use crate::pipeline::types::{DateKind, Label, RawMessage, StatusDates};

/// Year-less dates further than this before the received date are read as
/// next year's.
const ROLLOVER_DAYS: i64 = 30;

const MONTH: &str = r"(?P<mon>jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sept?(?:ember)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)";

static ISO_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?P<y>\d{4})-(?P<m>\d{1,2})-(?P<d>\d{1,2})\b").expect("valid regex")
});

static US_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?P<m>\d{1,2})/(?P<d>\d{1,2})/(?P<y>\d{4}|\d{2})\b").expect("valid regex")
});

static MONTH_DAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b{MONTH}\.?\s+(?P<d>\d{{1,2}})(?:st|nd|rd|th)?\b(?:,?\s+(?P<y>\d{{4}})\b)?"
    ))
    .expect("valid regex")
});

static DAY_MONTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?P<d>\d{{1,2}})(?:st|nd|rd|th)?\s+(?:of\s+)?{MONTH}\b\.?(?:,?\s+(?P<y>\d{{4}})\b)?"
    ))
    .expect("valid regex")
});

static RELATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:(?P<today>today)|(?P<tomorrow>tomorrow)|(?P<qual>next|this|on)\s+(?P<wd>monday|tuesday|wednesday|thursday|friday|saturday|sunday)|in\s+(?P<n>\d{1,2})\s+(?P<unit>day|week)s?)\b",
    )
    .expect("valid regex")
});

/// Time directly after a date: `at 2:30 PM`, `14:00`, `T09:15`.
static TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:t|\s*,?\s*(?:(?:at|@)\s*)?)(?P<h>\d{1,2})(?::(?P<min>\d{2}))?(?:\s*(?P<ampm>[ap])\.?m\b\.?)?")
        .expect("valid regex")
});

/// A date found in text, with its byte span.
#[derive(Debug, Clone, PartialEq)]
pub struct DateMention {
    pub at: DateTime<Utc>,
    pub start: usize,
    pub end: usize,
}

/// Every date expression in `text`, in order of appearance. Overlapping
/// matches keep the earliest, then longest.
pub fn find_dates(text: &str, reference: DateTime<Utc>) -> Vec<DateMention> {
    let mut found: Vec<DateMention> = Vec::new();

    let absolute: [(&Regex, fn(&Captures<'_>, NaiveDate) -> Option<NaiveDate>); 4] = [
        (&*ISO_DATE, numeric_date),
        (&*US_DATE, numeric_date),
        (&*MONTH_DAY, named_month_date),
        (&*DAY_MONTH, named_month_date),
    ];
    let today = reference.date_naive();

    for (regex, parse) in absolute {
        for caps in regex.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            if let Some(date) = parse(&caps, today) {
                found.extend(with_time(text, whole.start(), whole.end(), date));
            }
        }
    }
    for caps in RELATIVE.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        if let Some(date) = relative_date(&caps, today) {
            found.extend(with_time(text, whole.start(), whole.end(), date));
        }
    }

    found.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
    let mut kept: Vec<DateMention> = Vec::with_capacity(found.len());
    for mention in found {
        if kept.last().is_none_or(|last| mention.start >= last.end) {
            kept.push(mention);
        }
    }
    kept
}

fn with_time(text: &str, start: usize, end: usize, date: NaiveDate) -> Option<DateMention> {
    let (time, end) = match TIME.captures(&text[end..]).and_then(|c| parse_time(&c)) {
        Some((h, m, len)) => ((h, m), end + len),
        None => ((0, 0), end),
    };
    let at = date.and_hms_opt(time.0, time.1, 0)?.and_utc();
    Some(DateMention { at, start, end })
}

/// Hour, minute and matched length. A bare number is not a time.
fn parse_time(caps: &Captures<'_>) -> Option<(u32, u32, usize)> {
    let len = caps.get(0)?.end();
    let mut hour: u32 = caps.name("h")?.as_str().parse().ok()?;
    let minute: u32 = match caps.name("min") {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    let ampm = caps.name("ampm").map(|m| m.as_str().to_ascii_lowercase());
    if caps.name("min").is_none() && ampm.is_none() {
        return None;
    }
    match ampm.as_deref() {
        Some("p") if hour < 12 => hour += 12,
        Some("a") if hour == 12 => hour = 0,
        Some(_) if hour > 12 => return None,
        _ => {}
    }
    (hour < 24 && minute < 60).then_some((hour, minute, len))
}

fn numeric_date(caps: &Captures<'_>, _today: NaiveDate) -> Option<NaiveDate> {
    let mut year: i32 = caps.name("y")?.as_str().parse().ok()?;
    if year < 100 {
        year += 2000;
    }
    let month = caps.name("m")?.as_str().parse().ok()?;
    let day = caps.name("d")?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn named_month_date(caps: &Captures<'_>, today: NaiveDate) -> Option<NaiveDate> {
    let month = month_number(caps.name("mon")?.as_str())?;
    let day = caps.name("d")?.as_str().parse().ok()?;
    if let Some(year) = caps.name("y") {
        return NaiveDate::from_ymd_opt(year.as_str().parse().ok()?, month, day);
    }
    let date = NaiveDate::from_ymd_opt(today.year(), month, day)?;
    if date < today - Duration::days(ROLLOVER_DAYS) {
        NaiveDate::from_ymd_opt(today.year() + 1, month, day)
    } else {
        Some(date)
    }
}

fn relative_date(caps: &Captures<'_>, today: NaiveDate) -> Option<NaiveDate> {
    if caps.name("today").is_some() {
        return Some(today);
    }
    if caps.name("tomorrow").is_some() {
        return today.succ_opt();
    }
    if let Some(n) = caps.name("n") {
        let n: i64 = n.as_str().parse().ok()?;
        let unit = caps.name("unit")?.as_str().to_ascii_lowercase();
        let days = if unit == "week" { n * 7 } else { n };
        return today.checked_add_signed(Duration::days(days));
    }
    let weekday: Weekday = caps.name("wd")?.as_str().parse().ok()?;
    let qualifier = caps.name("qual")?.as_str().to_ascii_lowercase();
    let mut ahead = (weekday.num_days_from_monday() as i64
        - today.weekday().num_days_from_monday() as i64)
        .rem_euclid(7);
    if ahead == 0 && qualifier == "next" {
        ahead = 7;
    }
    today.checked_add_signed(Duration::days(ahead))
}

fn month_number(name: &str) -> Option<u32> {
    let prefix: String = name.chars().take(3).collect::<String>().to_ascii_lowercase();
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

/// Split on newlines and sentence punctuation followed by whitespace.
fn sentences(text: &str) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let bytes = rest.as_bytes();
        let mut cut = rest.len();
        let mut skip = 0;
        for (i, b) in bytes.iter().enumerate() {
            if *b == b'\n' {
                cut = i;
                skip = 1;
                break;
            }
            if matches!(b, b'.' | b'!' | b'?')
                && bytes.get(i + 1).is_some_and(|n| n.is_ascii_whitespace())
            {
                cut = i + 1;
                skip = 1;
                break;
            }
        }
        let sentence = &rest[..cut];
        rest = &rest[(cut + skip).min(rest.len())..];
        Some(sentence)
    })
    .filter(|s| !s.trim().is_empty())
}

/// Extracts status dates for one message.
pub struct StatusDateExtractor<'a> {
    patterns: &'a PatternStore,
}

impl<'a> StatusDateExtractor<'a> {
    pub fn new(patterns: &'a PatternStore) -> Self {
        Self { patterns }
    }

    pub fn extract(&self, label: Label, message: &RawMessage) -> StatusDates {
        let mut dates = StatusDates::default();
        let received = message.received_at;

        match label {
            Label::Rejection => {
                let found = find_dates(&message.body, received);
                if found.is_empty() {
                    dates.push(DateKind::Rejection, received);
                }
                for mention in found {
                    dates.push(DateKind::Rejection, mention.at);
                }
                dates.push(DateKind::Response, received);
            }
            Label::InterviewInvite => {
                for mention in find_dates(&message.body, received) {
                    dates.push(DateKind::Interview, mention.at);
                }
                dates.push(DateKind::Response, received);
            }
            Label::JobApplication => {
                for sentence in sentences(&message.body) {
                    if !self.patterns.follow_up_cues.iter().any(|r| r.is_match(sentence)) {
                        continue;
                    }
                    for mention in find_dates(sentence, received) {
                        dates.push(DateKind::FollowUp, mention.at);
                    }
                }
            }
            Label::HeadHunter | Label::Noise | Label::Other => {}
        }

        dates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    /// Wednesday, 2025-03-05 09:00 UTC.
    fn received() -> DateTime<Utc> {
        at(2025, 3, 5, 9, 0)
    }

    fn dates_in(text: &str) -> Vec<DateTime<Utc>> {
        find_dates(text, received()).into_iter().map(|m| m.at).collect()
    }

    fn make_message(body: &str) -> RawMessage {
        RawMessage {
            id: "m-1".into(),
            sender: "hr@acme.com".into(),
            sender_domain: "acme.com".into(),
            subject: "Update".into(),
            body: body.into(),
            html: None,
            headers: BTreeMap::new(),
            thread_id: "t".into(),
            received_at: received(),
        }
    }

    fn patterns() -> PatternStore {
        PatternStore::from_json(r#"{"ignore": ["promo"]}"#).unwrap()
    }

    #[test]
    fn absolute_formats() {
        assert_eq!(dates_in("on 2025-03-12"), vec![at(2025, 3, 12, 0, 0)]);
        assert_eq!(dates_in("by 03/14/2025"), vec![at(2025, 3, 14, 0, 0)]);
        assert_eq!(dates_in("March 20, 2026"), vec![at(2026, 3, 20, 0, 0)]);
        assert_eq!(dates_in("the 7th of April"), vec![at(2025, 4, 7, 0, 0)]);
        assert_eq!(dates_in("Sept. 2"), vec![at(2025, 9, 2, 0, 0)]);
    }

    #[test]
    fn times_attach_to_dates() {
        assert_eq!(dates_in("March 10 at 2:30 PM"), vec![at(2025, 3, 10, 14, 30)]);
        assert_eq!(dates_in("2025-03-11 14:00"), vec![at(2025, 3, 11, 14, 0)]);
        assert_eq!(dates_in("tomorrow at 10am"), vec![at(2025, 3, 6, 10, 0)]);
        // A bare number is not a time.
        assert_eq!(dates_in("March 10 3 people"), vec![at(2025, 3, 10, 0, 0)]);
    }

    #[test]
    fn relative_expressions() {
        assert_eq!(dates_in("today"), vec![at(2025, 3, 5, 0, 0)]);
        assert_eq!(dates_in("next Friday"), vec![at(2025, 3, 7, 0, 0)]);
        assert_eq!(dates_in("next Wednesday"), vec![at(2025, 3, 12, 0, 0)]);
        assert_eq!(dates_in("this Wednesday"), vec![at(2025, 3, 5, 0, 0)]);
        assert_eq!(dates_in("on Monday"), vec![at(2025, 3, 10, 0, 0)]);
        assert_eq!(dates_in("in 2 weeks"), vec![at(2025, 3, 19, 0, 0)]);
        assert_eq!(dates_in("in 3 days"), vec![at(2025, 3, 8, 0, 0)]);
    }

    #[test]
    fn yearless_dates_roll_over() {
        // More than 30 days before received: next year.
        assert_eq!(dates_in("January 10"), vec![at(2026, 1, 10, 0, 0)]);
        // Within 30 days before: same year.
        assert_eq!(dates_in("February 20"), vec![at(2025, 2, 20, 0, 0)]);
    }

    #[test]
    fn invalid_dates_are_skipped() {
        assert!(dates_in("February 30").is_empty());
        assert!(dates_in("13/45/2025").is_empty());
        assert!(dates_in("may I ask").is_empty());
    }

    #[test]
    fn overlapping_matches_keep_longest() {
        let found = find_dates("Tuesday, March 11, 2025 at 3pm", received());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].at, at(2025, 3, 11, 15, 0));
    }

    #[test]
    fn rejection_without_body_dates_uses_received() {
        let patterns = patterns();
        let extractor = StatusDateExtractor::new(&patterns);
        let dates = extractor.extract(Label::Rejection, &make_message("We decided not to proceed."));
        assert_eq!(dates.get(DateKind::Rejection), &[received()]);
        assert_eq!(dates.get(DateKind::Response), &[received()]);
    }

    #[test]
    fn interview_collects_every_body_date() {
        let patterns = patterns();
        let extractor = StatusDateExtractor::new(&patterns);
        let msg = make_message("Are you free March 10 at 2:30 PM or March 12 at 11:00?");
        let dates = extractor.extract(Label::InterviewInvite, &msg);
        assert_eq!(
            dates.get(DateKind::Interview),
            &[at(2025, 3, 10, 14, 30), at(2025, 3, 12, 11, 0)]
        );
        assert_eq!(dates.get(DateKind::Response), &[received()]);
    }

    #[test]
    fn interview_without_dates_still_records_response() {
        let patterns = patterns();
        let extractor = StatusDateExtractor::new(&patterns);
        let dates = extractor.extract(Label::InterviewInvite, &make_message("Let's talk soon"));
        assert!(dates.get(DateKind::Interview).is_empty());
        assert_eq!(dates.get(DateKind::Response), &[received()]);
    }

    #[test]
    fn follow_up_needs_cue_in_same_sentence() {
        let patterns = patterns();
        let extractor = StatusDateExtractor::new(&patterns);
        let msg = make_message(
            "We received your application on 2025-03-04. We will follow up by March 19.",
        );
        let dates = extractor.extract(Label::JobApplication, &msg);
        assert_eq!(dates.get(DateKind::FollowUp), &[at(2025, 3, 19, 0, 0)]);
        assert!(dates.get(DateKind::Response).is_empty());
    }

    #[test]
    fn other_labels_extract_nothing() {
        let patterns = patterns();
        let extractor = StatusDateExtractor::new(&patterns);
        let msg = make_message("Interview on March 10 at 2pm");
        for label in [Label::HeadHunter, Label::Noise, Label::Other] {
            assert!(extractor.extract(label, &msg).is_empty());
        }
    }

    #[test]
    fn sentence_split() {
        let parts: Vec<&str> = sentences("One. Two!\nThree? Four").collect();
        assert_eq!(parts, vec!["One.", "Two!", "Three?", "Four"]);
    }
}
