//! `sipmsg.log` reader.
//!
//! A message starts with a header line such as
//!
//! ```text
//! Jun 21 12:13:14.567 On [0:0]10.0.0.1:5060 sent to 10.0.0.2:5060
//! ```
//!
//! followed by the raw SIP text and closed by a line holding only `--`. Anything between
//! messages is ignored.

use crate::ip::AddressPair;
use crate::Error;
use chrono::{
    DateTime, Datelike, LocalResult, Month, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    TimeZone, Utc,
};
use chrono_tz::Tz;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_till, take_till1, take_while_m_n},
    character::complete::{alpha1, char, digit1, space1},
    combinator::{map_res, value},
    sequence::{delimited, tuple},
    IResult,
};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

const TERMINATOR: &[u8] = b"--";

#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize)]
pub enum Direction {
    /// `sent to`: the local node is the source.
    Outgoing,
    /// `received from`: the peer is the source.
    Incoming,
}

/// A single SIP message recovered from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    /// Seconds since the Unix epoch.
    pub seconds: i64,
    pub microseconds: u32,
    pub direction: Direction,
    pub local: SocketAddr,
    pub peer: SocketAddr,
    /// Raw message text, line endings included.
    pub payload: Vec<u8>,
}

impl MessageRecord {
    pub fn source(&self) -> SocketAddr {
        match self.direction {
            Direction::Outgoing => self.local,
            Direction::Incoming => self.peer,
        }
    }

    pub fn destination(&self) -> SocketAddr {
        match self.direction {
            Direction::Outgoing => self.peer,
            Direction::Incoming => self.local,
        }
    }

    pub fn addresses(&self) -> Result<AddressPair, Error> {
        AddressPair::new(self.source().ip(), self.destination().ip())
    }

    /// SIP request or status line, i.e. the first payload line.
    pub fn start_line(&self) -> String {
        let line = self
            .payload
            .split(|b| *b == b'\n')
            .next()
            .unwrap_or_default();

        String::from_utf8_lossy(line).trim_end().to_string()
    }
}

/// Header fields as they appear in the log, before any validation.
#[derive(Debug, PartialEq, Eq)]
struct RawHeader<'a> {
    month: &'a str,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    millis: u32,
    direction: Direction,
    local: &'a str,
    peer: &'a str,
}

fn fixed_digits<'a>(n: usize) -> impl FnMut(&'a str) -> IResult<&'a str, u32> {
    map_res(take_while_m_n(n, n, |c: char| c.is_ascii_digit()), |s: &str| {
        s.parse::<u32>()
    })
}

fn endpoint(i: &str) -> IResult<&str, &str> {
    take_till1(|c: char| c.is_whitespace())(i)
}

fn direction(i: &str) -> IResult<&str, Direction> {
    alt((
        value(Direction::Outgoing, tag("sent to")),
        value(Direction::Incoming, tag("received from")),
    ))(i)
}

fn header(i: &str) -> IResult<&str, RawHeader<'_>> {
    let (i, month) = alpha1(i)?;
    let (i, _) = space1(i)?;
    let (i, day) = map_res(digit1, |s: &str| s.parse::<u32>())(i)?;
    let (i, _) = space1(i)?;
    let (i, (hour, _, minute, _, second, _, millis)) = tuple((
        fixed_digits(2),
        char(':'),
        fixed_digits(2),
        char(':'),
        fixed_digits(2),
        char('.'),
        fixed_digits(3),
    ))(i)?;
    let (i, _) = delimited(space1, tag("On"), space1)(i)?;
    // Interface tag, e.g. `[0:0]`
    let (i, _) = delimited(char('['), take_till(|c: char| c == ']'), char(']'))(i)?;
    let (i, local) = endpoint(i)?;
    let (i, direction) = delimited(space1, direction, space1)(i)?;
    let (i, peer) = endpoint(i)?;

    Ok((
        i,
        RawHeader {
            month,
            day,
            hour,
            minute,
            second,
            millis,
            direction,
            local,
            peer,
        },
    ))
}

/// Parse `addr:port`, with or without brackets around IPv6 addresses.
fn parse_endpoint(s: &str) -> Option<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr);
    }

    let (ip, port) = s.rsplit_once(':')?;

    Some(SocketAddr::new(ip.parse::<IpAddr>().ok()?, port.parse().ok()?))
}

/// Interpret a wall clock time in `tz`.
///
/// Ambiguous times resolve to the earlier instant. Times inside a DST gap are read with the
/// offset in force before the gap, so they land between the instants on either side of it.
fn localize(tz: &Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            // Offset in force a day earlier, before the transition
            let offset = tz
                .offset_from_utc_datetime(&(naive - chrono::Duration::days(1)))
                .fix();

            Utc.from_utc_datetime(
                &(naive - chrono::Duration::seconds(i64::from(offset.local_minus_utc()))),
            )
        }
    }
}

/// Resolve a year-less log timestamp against the log file modification time.
///
/// The year of `mtime` (in `tz`) is tried first. If that puts the message after the file was last
/// written, the previous year is used instead. Only one year of rollback is ever applied.
pub fn resolve_timestamp(
    month: u32,
    day: u32,
    time: NaiveTime,
    mtime: DateTime<Utc>,
    tz: &Tz,
) -> Option<DateTime<Utc>> {
    let at = |year: i32| {
        NaiveDate::from_ymd_opt(year, month, day).map(|date| localize(tz, date.and_time(time)))
    };

    let year = mtime.with_timezone(tz).year();

    match at(year) {
        Some(instant) if instant <= mtime => Some(instant),
        _ => at(year - 1),
    }
}

/// Header that has been matched and validated, waiting for its body.
#[derive(Debug)]
struct Pending {
    timestamp: DateTime<Utc>,
    direction: Direction,
    local: SocketAddr,
    peer: SocketAddr,
    payload: Vec<u8>,
    line_number: usize,
}

impl Pending {
    fn into_record(self) -> MessageRecord {
        MessageRecord {
            seconds: self.timestamp.timestamp(),
            microseconds: self.timestamp.timestamp_subsec_micros(),
            direction: self.direction,
            local: self.local,
            peer: self.peer,
            payload: self.payload,
        }
    }
}

#[derive(Debug)]
enum State {
    SeekingHeader,
    CollectingBody(Pending),
}

/// Lazy iterator over the messages in a `sipmsg.log` stream.
///
/// At most one message is buffered. Read errors are yielded once and end the iteration.
pub struct SipMsgLog<R> {
    reader: R,

    /// Used in diagnostics only.
    name: String,

    /// Last modification time of the log, anchors year inference.
    mtime: DateTime<Utc>,

    timezone: Tz,

    line: Vec<u8>,

    line_number: usize,

    state: State,

    done: bool,
}

impl<R> std::fmt::Debug for SipMsgLog<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SipMsgLog")
            .field("name", &self.name)
            .field("mtime", &self.mtime)
            .field("timezone", &self.timezone)
            .field("line_number", &self.line_number)
            .finish()
    }
}

impl SipMsgLog<BufReader<File>> {
    /// Open a log file, taking the modification time from its metadata.
    pub fn open(path: &Path, timezone: Tz) -> Result<Self, Error> {
        let file = File::open(path).map_err(|e| {
            log::error!("Failed to open log file {}: {}", path.display(), e);

            e
        })?;

        let mtime = DateTime::<Utc>::from(file.metadata()?.modified()?);

        Ok(Self::new(
            BufReader::new(file),
            path.display().to_string(),
            mtime,
            timezone,
        ))
    }
}

impl<R: BufRead> SipMsgLog<R> {
    pub fn new(reader: R, name: impl Into<String>, mtime: DateTime<Utc>, timezone: Tz) -> Self {
        Self {
            reader,
            name: name.into(),
            mtime,
            timezone,
            line: Vec::new(),
            line_number: 0,
            state: State::SeekingHeader,
            done: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtime(&self) -> DateTime<Utc> {
        self.mtime
    }

    /// Number of lines consumed so far.
    pub fn line_number(&self) -> usize {
        self.line_number
    }

    pub fn next_record(&mut self) -> Option<Result<MessageRecord, Error>> {
        if self.done {
            return None;
        }

        loop {
            self.line.clear();

            let read = match self.reader.read_until(b'\n', &mut self.line) {
                Ok(read) => read,
                Err(e) => {
                    self.done = true;

                    return Some(Err(e.into()));
                }
            };

            if read == 0 {
                self.done = true;

                if let State::CollectingBody(pending) = &self.state {
                    log::warn!(
                        "{}:{}: message is missing its terminator, dropped",
                        self.name,
                        pending.line_number
                    );
                }

                return None;
            }

            self.line_number += 1;

            let content = trim_line_ending(&self.line);

            let State::CollectingBody(pending) = &mut self.state else {
                if let Some(pending) = self.parse_header(content) {
                    self.state = State::CollectingBody(pending);
                }

                continue;
            };

            if content != TERMINATOR {
                pending.payload.extend_from_slice(&self.line);

                continue;
            }

            if let State::CollectingBody(pending) =
                std::mem::replace(&mut self.state, State::SeekingHeader)
            {
                return Some(Ok(pending.into_record()));
            }
        }
    }

    fn parse_header(&self, line: &[u8]) -> Option<Pending> {
        let text = std::str::from_utf8(line).ok()?;

        let Ok((_rest, raw)) = header(text) else {
            log::debug!("{}:{}: skipping {:?}", self.name, self.line_number, text);

            return None;
        };

        let warn = |what: &str| {
            log::warn!(
                "{}:{}: {}, skipping message {:?}",
                self.name,
                self.line_number,
                what,
                text
            );
        };

        let Some(month) = raw.month.parse::<Month>().ok() else {
            warn("unknown month");

            return None;
        };

        let Some(time) = NaiveTime::from_hms_milli_opt(raw.hour, raw.minute, raw.second, raw.millis)
        else {
            warn("invalid time of day");

            return None;
        };

        let (Some(local), Some(peer)) = (parse_endpoint(raw.local), parse_endpoint(raw.peer)) else {
            warn("invalid address");

            return None;
        };

        if local.is_ipv4() != peer.is_ipv4() {
            warn("local and peer address families differ");

            return None;
        }

        let Some(timestamp) = resolve_timestamp(
            month.number_from_month(),
            raw.day,
            time,
            self.mtime,
            &self.timezone,
        ) else {
            warn("date does not exist");

            return None;
        };

        Some(Pending {
            timestamp,
            direction: raw.direction,
            local,
            peer,
            payload: Vec::new(),
            line_number: self.line_number,
        })
    }
}

impl<R: BufRead> Iterator for SipMsgLog<R> {
    type Item = Result<MessageRecord, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record()
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);

    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    fn read_all(text: &str, mtime: DateTime<Utc>, tz: Tz) -> Vec<MessageRecord> {
        SipMsgLog::new(Cursor::new(text.as_bytes().to_vec()), "test", mtime, tz)
            .collect::<Result<Vec<_>, _>>()
            .expect("read")
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn parse_header_line() {
        let (rest, raw) =
            header("Jun 21 12:13:14.567 On [0:0]1.1.1.1:5060 sent to 2.2.2.2:5061").unwrap();

        assert_eq!(rest, "");
        assert_eq!(
            raw,
            RawHeader {
                month: "Jun",
                day: 21,
                hour: 12,
                minute: 13,
                second: 14,
                millis: 567,
                direction: Direction::Outgoing,
                local: "1.1.1.1:5060",
                peer: "2.2.2.2:5061",
            }
        );
    }

    #[test]
    fn parse_received_header_with_padded_day() {
        let (_, raw) =
            header("Jan  3 01:02:03.004 On [1:0]10.0.0.1:5060 received from 10.0.0.9:5080")
                .unwrap();

        assert_eq!(raw.day, 3);
        assert_eq!(raw.direction, Direction::Incoming);
        assert_eq!(raw.peer, "10.0.0.9:5080");
    }

    #[test]
    fn reject_non_header() {
        assert!(header("INVITE sip:bob@example.com SIP/2.0").is_err());
        assert!(header("Jun 21 12:13:14 On [0:0]1.1.1.1:5060 sent to 2.2.2.2:5060").is_err());
        assert!(header("Jun 21 12:13:14.567 On [0:0]1.1.1.1:5060 forwarded to 2.2.2.2:5060").is_err());
    }

    #[test]
    fn endpoints() {
        assert_eq!(
            parse_endpoint("10.0.0.1:5060"),
            Some("10.0.0.1:5060".parse().unwrap())
        );
        assert_eq!(
            parse_endpoint("[2001:db8::1]:5060"),
            Some("[2001:db8::1]:5060".parse().unwrap())
        );
        assert_eq!(
            parse_endpoint("2001:db8::1:5060"),
            Some("[2001:db8::1]:5060".parse().unwrap())
        );
        assert_eq!(parse_endpoint("10.0.0.1"), None);
        assert_eq!(parse_endpoint("10.0.0.1:70000"), None);
    }

    #[test]
    fn empty_log() {
        assert!(read_all("", Utc::now(), Tz::UTC).is_empty());
    }

    #[test]
    fn outgoing_message() {
        let records = read_all(
            "Jun 21 12:13:14.567 On [0:0]10.0.0.1:5060 sent to 10.0.0.2:5062\nspam\n--",
            at("2023-07-01T00:00:00Z"),
            Tz::UTC,
        );

        assert_eq!(records.len(), 1);

        let record = &records[0];

        assert_eq!(record.seconds, at("2023-06-21T12:13:14Z").timestamp());
        assert_eq!(record.microseconds, 567_000);
        assert_eq!(record.direction, Direction::Outgoing);
        assert_eq!(record.payload, b"spam\n");
        assert_eq!(record.source(), "10.0.0.1:5060".parse().unwrap());
        assert_eq!(record.destination(), "10.0.0.2:5062".parse().unwrap());
    }

    #[test]
    fn incoming_message_swaps_endpoints() {
        let records = read_all(
            "Jun 21 12:13:14.567 On [0:0]10.0.0.1:5060 received from 10.0.0.2:5062\nspam\n--\n",
            at("2023-07-01T00:00:00Z"),
            Tz::UTC,
        );

        assert_eq!(records[0].source(), "10.0.0.2:5062".parse().unwrap());
        assert_eq!(records[0].destination(), "10.0.0.1:5060".parse().unwrap());
    }

    #[test]
    fn noise_and_multiple_messages() {
        let log = concat!(
            "some banner\r\n",
            "Jun 21 12:13:14.567 On [0:0]10.0.0.1:5060 sent to 10.0.0.2:5060\r\n",
            "OPTIONS sip:10.0.0.2 SIP/2.0\r\n",
            "\r\n",
            "--\r\n",
            "garbage between messages\r\n",
            "Jun 21 12:13:15.001 On [0:0]10.0.0.1:5060 received from 10.0.0.2:5060\r\n",
            "SIP/2.0 200 OK\r\n",
            "--\r\n",
        );

        let records = read_all(log, at("2023-07-01T00:00:00Z"), Tz::UTC);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload, b"OPTIONS sip:10.0.0.2 SIP/2.0\r\n\r\n");
        assert_eq!(records[0].start_line(), "OPTIONS sip:10.0.0.2 SIP/2.0");
        assert_eq!(records[1].start_line(), "SIP/2.0 200 OK");
        assert_eq!(records[1].microseconds, 1_000);
    }

    #[test]
    fn unterminated_message_dropped() {
        let records = read_all(
            "Jun 21 12:13:14.567 On [0:0]10.0.0.1:5060 sent to 10.0.0.2:5060\nspam\n",
            at("2023-07-01T00:00:00Z"),
            Tz::UTC,
        );

        assert!(records.is_empty());
    }

    #[test]
    fn invalid_header_values_skipped() {
        let log = concat!(
            "Foo 21 12:13:14.567 On [0:0]10.0.0.1:5060 sent to 10.0.0.2:5060\n",
            "spam\n",
            "--\n",
            "Jun 21 25:13:14.567 On [0:0]10.0.0.1:5060 sent to 10.0.0.2:5060\n",
            "spam\n",
            "--\n",
            "Jun 21 12:13:14.567 On [0:0]10.0.0.1:5060 sent to ::1:5060\n",
            "spam\n",
            "--\n",
            "Jun 21 12:13:14.567 On [0:0]10.0.0.1:5060 sent to 10.0.0.3:5060\n",
            "kept\n",
            "--\n",
        );

        let records = read_all(log, at("2023-07-01T00:00:00Z"), Tz::UTC);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"kept\n");
    }

    /// Serves its bytes, then fails every read.
    struct FailingReader(Cursor<Vec<u8>>);

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.0.read(buf)? {
                0 => Err(std::io::Error::new(std::io::ErrorKind::Other, "device gone")),
                read => Ok(read),
            }
        }
    }

    #[test]
    fn read_error_ends_iteration() {
        let reader = FailingReader(Cursor::new(
            b"Jun 21 12:13:14.567 On [0:0]10.0.0.1:5060 sent to 10.0.0.2:5060\nspam\n--\n".to_vec(),
        ));

        let mut messages = SipMsgLog::new(
            BufReader::new(reader),
            "failing",
            at("2023-07-01T00:00:00Z"),
            Tz::UTC,
        );

        assert_eq!(messages.name(), "failing");
        assert!(matches!(messages.next(), Some(Ok(_))));
        assert_eq!(messages.line_number(), 3);
        assert!(matches!(messages.next(), Some(Err(Error::Io(_)))));
        assert!(messages.next().is_none());
        assert!(messages.next().is_none());
    }

    #[test]
    fn ipv6_message() {
        let records = read_all(
            "Jun 21 12:13:14.567 On [0:0][2001:db8::1]:5060 sent to [2001:db8::2]:5060\n--\n",
            at("2023-07-01T00:00:00Z"),
            Tz::UTC,
        );

        assert!(records[0].addresses().is_ok());
        assert!(records[0].local.is_ipv6());
        assert!(records[0].payload.is_empty());
    }

    #[test]
    fn same_year_as_mtime() {
        let time = NaiveTime::from_hms_milli_opt(12, 0, 0, 0).unwrap();

        let resolved =
            resolve_timestamp(3, 1, time, at("2024-06-01T00:00:00Z"), &Tz::UTC).unwrap();

        assert_eq!(resolved, at("2024-03-01T12:00:00Z"));
    }

    #[test]
    fn rolls_back_one_year_when_after_mtime() {
        let time = NaiveTime::from_hms_milli_opt(23, 0, 0, 0).unwrap();

        let resolved =
            resolve_timestamp(12, 31, time, at("2024-01-02T08:00:00Z"), &Tz::UTC).unwrap();

        assert_eq!(resolved, at("2023-12-31T23:00:00Z"));
    }

    #[test]
    fn rolls_back_only_once() {
        // An mtime one hour before the message on the same day still yields a year-old stamp,
        // never two.
        let time = NaiveTime::from_hms_milli_opt(13, 0, 0, 0).unwrap();

        let resolved =
            resolve_timestamp(5, 10, time, at("2024-05-10T12:00:00Z"), &Tz::UTC).unwrap();

        assert_eq!(resolved, at("2023-05-10T13:00:00Z"));
    }

    #[test]
    fn timezone_applied() {
        let time = NaiveTime::from_hms_milli_opt(12, 0, 0, 250).unwrap();

        let resolved = resolve_timestamp(
            1,
            15,
            time,
            at("2024-06-01T00:00:00Z"),
            &Tz::Europe__Warsaw,
        )
        .unwrap();

        assert_eq!(resolved, at("2024-01-15T11:00:00.250Z"));
    }

    #[test]
    fn mtime_year_taken_in_log_timezone() {
        // 2024-12-31T23:30Z is already 2025 in Warsaw
        let time = NaiveTime::from_hms_milli_opt(0, 10, 0, 0).unwrap();

        let resolved = resolve_timestamp(
            1,
            1,
            time,
            at("2024-12-31T23:30:00Z"),
            &Tz::Europe__Warsaw,
        )
        .unwrap();

        assert_eq!(resolved, at("2024-12-31T23:10:00Z"));
    }

    #[test]
    fn dst_gap_keeps_order() {
        // 02:00 to 03:00 does not exist in Warsaw on 2024-03-31
        let resolve = |hour, minute| {
            let time = NaiveTime::from_hms_milli_opt(hour, minute, 0, 0).unwrap();

            resolve_timestamp(3, 31, time, at("2024-06-01T00:00:00Z"), &Tz::Europe__Warsaw)
                .expect("resolved")
        };

        let before = resolve(1, 59);
        let gap = resolve(2, 30);
        let after = resolve(3, 0);

        assert_eq!(before, at("2024-03-31T00:59:00Z"));
        assert_eq!(gap, at("2024-03-31T01:30:00Z"));
        assert_eq!(after, at("2024-03-31T01:00:00Z"));
        assert!(before < gap);
    }

    #[test]
    fn dst_gap_messages_in_log_order() {
        let log = concat!(
            "Mar 31 01:59:00.000 On [0:0]10.0.0.1:5060 sent to 10.0.0.2:5060\n",
            "--\n",
            "Mar 31 02:30:00.000 On [0:0]10.0.0.1:5060 sent to 10.0.0.2:5060\n",
            "--\n",
        );

        let records = read_all(log, at("2024-06-01T00:00:00Z"), Tz::Europe__Warsaw);

        assert_eq!(records.len(), 2);
        assert!(records[0].seconds < records[1].seconds);
    }

    #[test]
    fn leap_day_outside_leap_year() {
        let time = NaiveTime::from_hms_milli_opt(12, 0, 0, 0).unwrap();

        // 2025 has no Feb 29, so 2024 is used
        assert_eq!(
            resolve_timestamp(2, 29, time, at("2025-06-01T00:00:00Z"), &Tz::UTC),
            Some(at("2024-02-29T12:00:00Z"))
        );

        // Neither 2023 nor 2022 has one
        assert_eq!(
            resolve_timestamp(2, 29, time, at("2023-06-01T00:00:00Z"), &Tz::UTC),
            None
        );
    }
}
