//! Minimal iCalendar reader: enough of RFC 5545 to pull `VEVENT` stays out of
//! booking-platform export feeds.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;
use tracing::debug;

/// Date or date-time value as written in the feed, before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedDate {
    Date(NaiveDate),
    Floating(NaiveDateTime),
    Utc(DateTime<Utc>),
}

impl FeedDate {
    /// Calendar date with any time of day dropped.
    pub fn date(&self) -> NaiveDate {
        match self {
            Self::Date(d) => *d,
            Self::Floating(dt) => dt.date(),
            Self::Utc(dt) => dt.date_naive(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEvent {
    pub uid: Option<String>,
    pub dtstart: Option<FeedDate>,
    pub dtend: Option<FeedDate>,
    pub summary: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub events: Vec<RawEvent>,
    pub rejected: Vec<ComponentError>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("document is not an iCalendar feed")]
    NotACalendar,
    #[error("{component} opened on line {line} is never closed")]
    Unterminated { component: String, line: usize },
}

/// A single `VEVENT` that could not be read. The rest of the feed is still usable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("event #{index} (uid {uid:?}, line {line}): {reason}")]
pub struct ComponentError {
    pub index: usize,
    pub line: usize,
    pub uid: Option<String>,
    pub reason: String,
}

struct ContentLine<'a> {
    number: usize,
    name: String,
    params: Vec<(String, String)>,
    value: &'a str,
}

impl ContentLine<'_> {
    fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Joins folded continuation lines; returns `(first line number, logical line)`.
fn unfold(text: &str) -> Vec<(usize, String)> {
    let mut lines: Vec<(usize, String)> = Vec::new();
    for (idx, raw) in text.split('\n').enumerate() {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(rest) = raw.strip_prefix([' ', '\t']) {
            if let Some((_, last)) = lines.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        if raw.trim().is_empty() {
            continue;
        }
        lines.push((idx + 1, raw.to_string()));
    }
    lines
}

fn split_content_line(number: usize, line: &str) -> Option<ContentLine<'_>> {
    let mut in_quotes = false;
    let mut colon = None;
    for (i, ch) in line.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ':' if !in_quotes => {
                colon = Some(i);
                break;
            }
            _ => {}
        }
    }
    let colon = colon?;
    let head = &line[..colon];
    let value = &line[colon + 1..];

    let mut parts = head.split(';');
    let name = parts.next()?.trim().to_ascii_uppercase();
    let params = parts
        .filter_map(|p| {
            let (k, v) = p.split_once('=')?;
            Some((k.trim().to_ascii_uppercase(), v.trim().trim_matches('"').to_string()))
        })
        .collect();

    Some(ContentLine {
        number,
        name,
        params,
        value,
    })
}

fn parse_feed_date(line: &ContentLine<'_>) -> Result<FeedDate, String> {
    let value = line.value.trim();
    let is_date = line
        .param("VALUE")
        .map(|v| v.eq_ignore_ascii_case("DATE"))
        .unwrap_or(false)
        || (value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit()));

    if is_date {
        return NaiveDate::parse_from_str(value, "%Y%m%d")
            .map(FeedDate::Date)
            .map_err(|e| format!("{} has invalid date {value:?}: {e}", line.name));
    }

    if let Some(utc) = value.strip_suffix('Z') {
        return NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S")
            .map(|dt| FeedDate::Utc(dt.and_utc()))
            .map_err(|e| format!("{} has invalid date-time {value:?}: {e}", line.name));
    }

    NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
        .map(FeedDate::Floating)
        .map_err(|e| format!("{} has invalid date-time {value:?}: {e}", line.name))
}

fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[derive(Default)]
struct EventBuilder {
    start_line: usize,
    nested_depth: usize,
    event: RawEvent,
    error: Option<String>,
}

impl EventBuilder {
    fn apply(&mut self, line: &ContentLine<'_>) {
        match line.name.as_str() {
            "UID" => self.event.uid = Some(line.value.trim().to_string()),
            "SUMMARY" => self.event.summary = Some(unescape_text(line.value.trim())),
            "STATUS" => self.event.status = Some(line.value.trim().to_ascii_uppercase()),
            "DTSTART" | "DTEND" => match parse_feed_date(line) {
                Ok(date) if line.name == "DTSTART" => self.event.dtstart = Some(date),
                Ok(date) => self.event.dtend = Some(date),
                Err(reason) => {
                    self.error.get_or_insert(reason);
                }
            },
            _ => {}
        }
    }
}

/// Parses an iCalendar document into raw events.
///
/// Document-level damage (not a calendar, truncated component) fails the whole
/// feed; a malformed event is reported in [`ParsedFeed::rejected`].
pub fn parse_ical(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let text = String::from_utf8_lossy(bytes);
    let lines = unfold(&text);

    let mut iter = lines.iter();
    match iter.next() {
        Some((_, first))
            if first
                .trim_start_matches('\u{feff}')
                .trim()
                .eq_ignore_ascii_case("BEGIN:VCALENDAR") => {}
        _ => return Err(ParseError::NotACalendar),
    }

    let mut parsed = ParsedFeed::default();
    let mut current: Option<EventBuilder> = None;
    let mut event_index = 0usize;
    let mut calendar_closed = false;

    for (number, raw) in iter {
        let Some(line) = split_content_line(*number, raw) else {
            continue;
        };
        let value = line.value.trim().to_ascii_uppercase();

        if let Some(builder) = current.as_mut() {
            match line.name.as_str() {
                "BEGIN" => builder.nested_depth += 1,
                "END" if builder.nested_depth > 0 => builder.nested_depth -= 1,
                "END" if value == "VEVENT" => {
                    if let Some(done) = current.take() {
                        event_index += 1;
                        match done.error {
                            Some(reason) => {
                                debug!(index = event_index, line = done.start_line, %reason, "VEVENT rejected");
                                parsed.rejected.push(ComponentError {
                                    index: event_index,
                                    line: done.start_line,
                                    uid: done.event.uid,
                                    reason,
                                });
                            }
                            None => parsed.events.push(done.event),
                        }
                    }
                }
                "END" => {
                    return Err(ParseError::Unterminated {
                        component: "VEVENT".to_string(),
                        line: builder.start_line,
                    });
                }
                _ if builder.nested_depth == 0 => builder.apply(&line),
                _ => {}
            }
            continue;
        }

        match line.name.as_str() {
            "BEGIN" if value == "VEVENT" => {
                current = Some(EventBuilder {
                    start_line: line.number,
                    ..Default::default()
                });
            }
            "END" if value == "VCALENDAR" => {
                calendar_closed = true;
                break;
            }
            _ => {}
        }
    }

    if let Some(builder) = current {
        return Err(ParseError::Unterminated {
            component: "VEVENT".to_string(),
            line: builder.start_line,
        });
    }
    if !calendar_closed {
        return Err(ParseError::Unterminated {
            component: "VCALENDAR".to_string(),
            line: lines.first().map(|(n, _)| *n).unwrap_or(1),
        });
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn reads_all_day_and_timed_events() {
        let doc = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
BEGIN:VEVENT\r\n\
UID:abc@airbnb.com\r\n\
DTSTART;VALUE=DATE:20250720\r\n\
DTEND;VALUE=DATE:20250820\r\n\
SUMMARY:Reserved\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
UID:def\r\n\
DTSTART:20250901T150000Z\r\n\
DTEND;TZID=\"America/Los_Angeles\":20250905T110000\r\n\
SUMMARY:Guest\\, with comma\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

        let feed = parse_ical(doc.as_bytes()).expect("parse");
        assert!(feed.rejected.is_empty());
        assert_eq!(feed.events.len(), 2);

        let first = &feed.events[0];
        assert_eq!(first.uid.as_deref(), Some("abc@airbnb.com"));
        assert_eq!(first.dtstart, Some(FeedDate::Date(d(2025, 7, 20))));
        assert_eq!(first.dtend.map(|x| x.date()), Some(d(2025, 8, 20)));

        let second = &feed.events[1];
        assert_eq!(
            second.dtstart,
            Some(FeedDate::Utc(Utc.with_ymd_and_hms(2025, 9, 1, 15, 0, 0).single().unwrap()))
        );
        assert_eq!(second.dtend.map(|x| x.date()), Some(d(2025, 9, 5)));
        assert_eq!(second.summary.as_deref(), Some("Guest, with comma"));
    }

    #[test]
    fn folded_lines_are_joined() {
        let doc = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:very-long-\n identifier\nDTSTART:20250101\nDTEND:20250103\nEND:VEVENT\nEND:VCALENDAR\n";
        let feed = parse_ical(doc.as_bytes()).expect("parse");
        assert_eq!(feed.events[0].uid.as_deref(), Some("very-long-identifier"));
    }

    #[test]
    fn nested_alarm_properties_do_not_leak_into_event() {
        let doc = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:x\nDTSTART:20250101\nDTEND:20250103\nBEGIN:VALARM\nSUMMARY:Alarm text\nEND:VALARM\nSUMMARY:Reserved\nEND:VEVENT\nEND:VCALENDAR\n";
        let feed = parse_ical(doc.as_bytes()).expect("parse");
        assert_eq!(feed.events[0].summary.as_deref(), Some("Reserved"));
    }

    #[test]
    fn malformed_event_is_rejected_without_failing_feed() {
        let doc = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:bad\nDTSTART:2025-01-01\nDTEND:20250103\nEND:VEVENT\nBEGIN:VEVENT\nUID:good\nDTSTART:20250105\nDTEND:20250107\nEND:VEVENT\nEND:VCALENDAR\n";
        let feed = parse_ical(doc.as_bytes()).expect("parse");
        assert_eq!(feed.events.len(), 1);
        assert_eq!(feed.events[0].uid.as_deref(), Some("good"));
        assert_eq!(feed.rejected.len(), 1);
        assert_eq!(feed.rejected[0].uid.as_deref(), Some("bad"));
        assert_eq!(feed.rejected[0].index, 1);
    }

    #[test]
    fn non_calendar_documents_fail() {
        assert!(matches!(
            parse_ical(b"<html><body>Service unavailable</body></html>"),
            Err(ParseError::NotACalendar)
        ));
        assert!(matches!(parse_ical(b""), Err(ParseError::NotACalendar)));
    }

    #[test]
    fn truncated_documents_fail() {
        let cut_mid_event = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:x\nDTSTART:20250101\n";
        assert!(matches!(
            parse_ical(cut_mid_event.as_bytes()),
            Err(ParseError::Unterminated { ref component, .. }) if component == "VEVENT"
        ));

        let cut_after_event =
            "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:x\nDTSTART:20250101\nDTEND:20250102\nEND:VEVENT\n";
        assert!(matches!(
            parse_ical(cut_after_event.as_bytes()),
            Err(ParseError::Unterminated { ref component, .. }) if component == "VCALENDAR"
        ));
    }
}
