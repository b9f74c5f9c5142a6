//! Directory listings as sent by `LIST` (Unix `ls -l` and DOS/IIS
//! flavours) and `MLSD`.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use ferry_common::DirEntry;

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// How the raw listing is to be read.
#[derive(Debug, Clone, Copy)]
pub struct ListingFormat {
    pub mlsd: bool,
    /// Offset of the server's local time to UTC. MLSD times are UTC.
    pub timezone_offset_minutes: i32,
    /// Times without a year are placed in the year before this date if
    /// they would be in its future
    pub now: DateTime<Utc>,
}

impl ListingFormat {
    pub fn new(mlsd: bool, timezone_offset_minutes: i32) -> Self {
        Self {
            mlsd,
            timezone_offset_minutes,
            now: Utc::now(),
        }
    }
}

/// Parses a complete listing. Lines nobody understands are skipped and
/// returned separately for logging.
pub fn parse_listing(data: &[u8], format: &ListingFormat) -> (Vec<DirEntry>, Vec<String>) {
    let text = String::from_utf8_lossy(data);
    let mut entries = vec![];
    let mut rejected = vec![];
    for line in text.split(['\r', '\n']) {
        if line.trim().is_empty() {
            continue;
        }
        let entry = if format.mlsd {
            parse_mlsd_line(line)
        } else {
            parse_unix_line(line, format).or_else(|| parse_dos_line(line, format))
        };
        match entry {
            Some(entry) if entry.name != "." && entry.name != ".." => entries.push(entry),
            Some(_) => {}
            None if line.starts_with("total ") => {}
            None => rejected.push(line.to_owned()),
        }
    }
    (entries, rejected)
}

/// Whitespace-separated tokens with their byte offsets.
fn tokens(line: &str) -> Vec<(usize, &str)> {
    let mut result = vec![];
    let mut start = None;
    for (i, c) in line.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                result.push((s, &line[s..i]));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        result.push((s, &line[s..]));
    }
    result
}

fn month(token: &str) -> Option<u32> {
    let lower = token.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| lower.starts_with(m))
        .map(|i| i as u32 + 1)
}

fn server_time(naive: NaiveDateTime, format: &ListingFormat) -> DateTime<Utc> {
    Utc.from_utc_datetime(&naive) - Duration::minutes(i64::from(format.timezone_offset_minutes))
}

/// `drwxr-xr-x 2 owner group 4096 Jan 31 12:00 name` and its variants
/// without group, with years or with `name -> target` links.
fn parse_unix_line(line: &str, format: &ListingFormat) -> Option<DirEntry> {
    let tokens = tokens(line);
    let permissions = tokens.first()?.1;
    let kind = permissions.chars().next()?;
    if !matches!(kind, '-' | 'd' | 'l' | 'b' | 'c' | 'p' | 's') || permissions.len() < 10 {
        return None;
    }

    // the size is the number right before the month
    let month_index = (3..tokens.len().saturating_sub(3)).find(|i| {
        month(tokens[*i].1).is_some()
            && tokens[*i - 1].1.parse::<i64>().is_ok()
            && tokens[*i + 1].1.parse::<u32>().is_ok()
    })?;
    let size: i64 = tokens[month_index - 1].1.parse().ok()?;
    let month = month(tokens[month_index].1)?;
    let day: u32 = tokens[month_index + 1].1.parse().ok()?;
    let year_or_time = tokens[month_index + 2];
    let name_start = year_or_time.0 + year_or_time.1.len() + 1;
    let mut name = line.get(name_start..)?.to_owned();
    if name.is_empty() {
        return None;
    }

    let time = if let Some((h, m)) = year_or_time.1.split_once(':') {
        let time = NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)?;
        let year = format.now.year();
        let mut date = NaiveDate::from_ymd_opt(year, month, day)?;
        let candidate = server_time(date.and_time(time), format);
        if candidate > format.now + Duration::days(1) {
            date = NaiveDate::from_ymd_opt(year - 1, month, day)?;
        }
        server_time(date.and_time(time), format)
    } else {
        let year = year_or_time.1.parse().ok()?;
        server_time(NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)?, format)
    };

    let mut link_target = None;
    if kind == 'l' {
        if let Some((n, target)) = name.split_once(" -> ") {
            link_target = Some(target.to_owned());
            name = n.to_owned();
        }
    }
    let owner_group = tokens[2..month_index - 1]
        .iter()
        .map(|(_, t)| *t)
        .collect::<Vec<_>>()
        .join(" ");

    Some(DirEntry {
        name,
        size,
        is_dir: kind == 'd',
        is_link: kind == 'l',
        link_target,
        time: Some(time),
        permissions: permissions.to_owned(),
        owner_group,
        unsure: false,
    })
}

/// `01-31-24  02:15PM  <DIR>  name` and `2024-01-31 14:15 1234 name`.
fn parse_dos_line(line: &str, format: &ListingFormat) -> Option<DirEntry> {
    let tokens = tokens(line);
    if tokens.len() < 4 {
        return None;
    }
    let date = parse_dos_date(tokens[0].1)?;
    let (time, size_index) = match tokens[2].1.to_ascii_uppercase().as_str() {
        "AM" | "PM" => (format!("{}{}", tokens[1].1, tokens[2].1), 3),
        _ => (tokens[1].1.to_owned(), 2),
    };
    let time = parse_dos_time(&time)?;
    let size_token = tokens.get(size_index)?;
    let name = line.get(tokens.get(size_index + 1)?.0..)?.to_owned();
    let (is_dir, size) = if size_token.1.eq_ignore_ascii_case("<DIR>") {
        (true, -1)
    } else {
        (false, size_token.1.replace(',', "").parse().ok()?)
    };
    Some(DirEntry {
        name,
        size,
        is_dir,
        is_link: false,
        link_target: None,
        time: Some(server_time(date.and_time(time), format)),
        permissions: String::new(),
        owner_group: String::new(),
        unsure: false,
    })
}

fn parse_dos_date(token: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = token.split(['-', '/']).collect();
    let [a, b, c] = parts.as_slice() else {
        return None;
    };
    if a.len() == 4 {
        return NaiveDate::from_ymd_opt(a.parse().ok()?, b.parse().ok()?, c.parse().ok()?);
    }
    let mut year: i32 = c.parse().ok()?;
    if c.len() == 2 {
        year += if year < 70 { 2000 } else { 1900 };
    }
    NaiveDate::from_ymd_opt(year, a.parse().ok()?, b.parse().ok()?)
}

fn parse_dos_time(token: &str) -> Option<NaiveTime> {
    let upper = token.to_ascii_uppercase();
    let (clock, pm) = match upper.strip_suffix("PM") {
        Some(clock) => (clock, Some(true)),
        None => match upper.strip_suffix("AM") {
            Some(clock) => (clock, Some(false)),
            None => (upper.as_str(), None),
        },
    };
    let (h, m) = clock.split_once(':')?;
    let mut hour: u32 = h.parse().ok()?;
    match pm {
        Some(true) if hour < 12 => hour += 12,
        Some(false) if hour == 12 => hour = 0,
        _ => {}
    }
    NaiveTime::from_hms_opt(hour, m.parse().ok()?, 0)
}

/// `type=file;size=10;modify=20240131120000; name`
pub fn parse_mlsd_line(line: &str) -> Option<DirEntry> {
    let (facts, name) = line.split_once(' ')?;
    if name.is_empty() {
        return None;
    }
    let mut entry = DirEntry::file(name, -1);
    let mut owner = None;
    let mut group = None;
    for fact in facts.split(';').filter(|f| !f.is_empty()) {
        let (key, value) = fact.split_once('=')?;
        match key.to_ascii_lowercase().as_str() {
            "type" => match value.to_ascii_lowercase().as_str() {
                "dir" => entry.is_dir = true,
                // the listed directory itself and its parent
                "cdir" | "pdir" => entry.name = ".".into(),
                "os.unix=symlink" | "os.unix=slink" => entry.is_link = true,
                t if t.starts_with("os.unix=slink:") => {
                    entry.is_link = true;
                    entry.link_target = value.get(14..).map(str::to_owned);
                }
                _ => {}
            },
            "size" | "sizd" => entry.size = value.parse().unwrap_or(-1),
            "modify" => {
                let digits = value.split('.').next().unwrap_or_default();
                entry.time = NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S")
                    .ok()
                    .map(|t| Utc.from_utc_datetime(&t));
            }
            "perm" if entry.permissions.is_empty() => entry.permissions = value.to_owned(),
            "unix.mode" => entry.permissions = value.to_owned(),
            "unix.owner" | "unix.uid" => owner = Some(value.to_owned()),
            "unix.group" | "unix.gid" => group = Some(value.to_owned()),
            _ => {}
        }
    }
    if entry.is_dir {
        entry.size = -1;
    }
    entry.owner_group = [owner, group].into_iter().flatten().collect::<Vec<_>>().join(" ");
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(mlsd: bool) -> ListingFormat {
        ListingFormat {
            mlsd,
            timezone_offset_minutes: 0,
            now: Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn unix_listing() {
        let data = b"total 12\r\n\
drwxr-xr-x   2 ftp      ftp          4096 Feb 01 09:30 pub\r\n\
-rw-r--r--   1 ftp      ftp            10 Dec 24  2023 notes with spaces.txt\r\n\
lrwxrwxrwx   1 ftp      ftp             3 Mar 10 08:00 latest -> pub\r\n\
-rw-r--r--   1 owner    1234 Apr 02 10:00 nogroup\r\n\
drwxr-xr-x   2 ftp      ftp          4096 Jan 01 00:00 .\r\n";
        let (entries, rejected) = parse_listing(data, &format(false));
        assert!(rejected.is_empty(), "{rejected:?}");
        assert_eq!(entries.len(), 4);

        assert!(entries[0].is_dir);
        assert_eq!(entries[0].name, "pub");
        assert_eq!(
            entries[0].time,
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 9, 30, 0).unwrap())
        );
        assert_eq!(entries[1].name, "notes with spaces.txt");
        assert_eq!(entries[1].size, 10);
        assert_eq!(entries[1].owner_group, "ftp ftp");
        assert!(entries[2].is_link);
        assert_eq!(entries[2].name, "latest");
        assert_eq!(entries[2].link_target.as_deref(), Some("pub"));
        // April is in the future of the listing, so it is last year's
        assert_eq!(
            entries[3].time,
            Some(Utc.with_ymd_and_hms(2023, 4, 2, 10, 0, 0).unwrap())
        );
        assert_eq!(entries[3].size, 1234);
    }

    #[test]
    fn dos_listing() {
        let data = b"01-31-24  02:15PM       <DIR>          Program Files\r\n\
2024-01-31  14:15             1,234 report.pdf\r\n";
        let (entries, rejected) = parse_listing(data, &format(false));
        assert!(rejected.is_empty());
        assert!(entries[0].is_dir);
        assert_eq!(entries[0].name, "Program Files");
        assert_eq!(
            entries[0].time,
            Some(Utc.with_ymd_and_hms(2024, 1, 31, 14, 15, 0).unwrap())
        );
        assert_eq!(entries[1].size, 1234);
        assert_eq!(entries[1].name, "report.pdf");
    }

    #[test]
    fn mlsd_listing() {
        let data = b"type=cdir;modify=20240101000000; .\r\n\
type=file;size=10;modify=20240131120000.123;UNIX.mode=0644;UNIX.owner=u; a b.txt\r\n\
type=dir;modify=20240101000000;perm=flcdmpe; sub\r\n\
type=OS.unix=slink:/target;size=7; link\r\n";
        let (entries, _) = parse_listing(data, &format(true));
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "a b.txt");
        assert_eq!(entries[0].size, 10);
        assert_eq!(entries[0].permissions, "0644");
        assert_eq!(
            entries[0].time,
            Some(Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap())
        );
        assert!(entries[1].is_dir && entries[1].size == -1);
        assert!(entries[2].is_link);
        assert_eq!(entries[2].link_target.as_deref(), Some("/target"));
    }

    #[test]
    fn server_timezone_is_applied() {
        let mut f = format(false);
        f.timezone_offset_minutes = 60;
        let (entries, _) =
            parse_listing(b"-rw-r--r-- 1 u g 1 Jan 02 2024 f\r\n", &f);
        assert_eq!(
            entries[0].time,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 23, 0, 0).unwrap())
        );
    }

    #[test]
    fn garbage_is_rejected() {
        let (entries, rejected) = parse_listing(b"this is not a listing\n", &format(false));
        assert!(entries.is_empty());
        assert_eq!(rejected, vec!["this is not a listing"]);
    }
}
