use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;

use chrono::{DateTime, Local, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of one reported event: 0=OTHER, 1=WARN, 2=INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Other = 0,
    Warn = 1,
    Info = 2,
}

impl Level {
    fn as_i64(self) -> i64 {
        self as i64
    }

    fn from_i64(v: i64) -> Level {
        match v {
            1 => Level::Warn,
            2 => Level::Info,
            _ => Level::Other,
        }
    }

    fn from_config(name: &str) -> Level {
        match name.to_ascii_uppercase().as_str() {
            "WARN" => Level::Warn,
            "INFO" => Level::Info,
            _ => Level::Other,
        }
    }
}

/// Which timestamps are rendered for a message's count cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DetailMode {
    None,
    First,
    Last,
    FirstLast,
    #[default]
    All,
}

impl DetailMode {
    fn from_config(name: Option<&str>) -> DetailMode {
        match name.map(|s| s.to_ascii_uppercase()).as_deref() {
            Some("NONE") => DetailMode::None,
            Some("FIRST") => DetailMode::First,
            Some("LAST") => DetailMode::Last,
            Some("FIRSTLAST") => DetailMode::FirstLast,
            _ => DetailMode::All,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            DetailMode::None => "NONE",
            DetailMode::First => "FIRST",
            DetailMode::Last => "LAST",
            DetailMode::FirstLast => "FIRSTLAST",
            DetailMode::All => "ALL",
        }
    }

    fn from_tag(tag: &str) -> DetailMode {
        match tag {
            "FIRST" => DetailMode::First,
            "LAST" => DetailMode::Last,
            "FIRSTLAST" => DetailMode::FirstLast,
            "ALL" => DetailMode::All,
            _ => DetailMode::None,
        }
    }
}

/// One on-disk journal record. `T` is a Unix-seconds timestamp (kept as a
/// plain integer, matching how [`crate::ban::Ban::timestamp`] is
/// represented, rather than an RFC3339 string).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRecord {
    #[serde(rename = "L")]
    level: i64,
    #[serde(rename = "T")]
    timestamp: i64,
    #[serde(rename = "M")]
    message: String,
    #[serde(rename = "D", default, skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

/// One reported event, ready to append.
#[derive(Debug, Clone)]
pub struct ReportRecord {
    pub level: Level,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub detail: DetailMode,
}

impl ReportRecord {
    pub fn new(level_name: &str, detail_name: Option<&str>, message: String, timestamp: DateTime<Utc>) -> Self {
        ReportRecord {
            level: Level::from_config(level_name),
            timestamp,
            message,
            detail: DetailMode::from_config(detail_name),
        }
    }
}

/// Accumulates report events across the day and flushes a digest when the
/// local hour wraps.
pub struct ReportAggregator {
    journal_path: PathBuf,
    file: Option<File>,
    last_hour: Option<u32>,
}

impl ReportAggregator {
    pub fn new(journal_path: PathBuf) -> Self {
        ReportAggregator {
            journal_path,
            file: None,
            last_hour: None,
        }
    }

    fn ensure_open(&mut self) -> std::io::Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let existed = self.journal_path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)?;
        if !existed {
            file.write_all(b"[")?;
        }
        self.file = Some(file);
        Ok(())
    }

    /// Append one record, flushing a digest through `mail` if the local
    /// hour has wrapped since the previous event.
    pub fn record(
        &mut self,
        rec: ReportRecord,
        local_hour: u32,
        mail: impl FnOnce(&str, &str),
    ) -> std::io::Result<()> {
        self.ensure_open()?;
        let raw = RawRecord {
            level: rec.level.as_i64(),
            timestamp: rec.timestamp.timestamp(),
            message: rec.message,
            detail: if rec.detail == DetailMode::default() {
                None
            } else {
                Some(rec.detail.tag().to_string())
            },
        };
        let line = serde_json::to_string(&raw).expect("RawRecord always serializes");
        if let Some(file) = self.file.as_mut() {
            write!(file, "{line},")?;
        }

        let wrapped = matches!(self.last_hour, Some(prev) if local_hour < prev);
        self.last_hour = Some(local_hour);
        if wrapped {
            self.flush(mail)?;
        }
        Ok(())
    }

    /// Close the journal, render the digest, mail it, and delete the file.
    pub fn flush(&mut self, mail: impl FnOnce(&str, &str)) -> std::io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.write_all(b"{}]")?;
        }
        let text = fs::read_to_string(&self.journal_path).unwrap_or_default();
        // the trailing `{}` sentinel written on close has none of
        // RawRecord's required fields, so decode through `Value` first and
        // drop it rather than letting one malformed element fail the
        // whole array.
        let raw_values: Vec<Value> = serde_json::from_str(&text).unwrap_or_default();
        let records: Vec<RawRecord> = raw_values
            .into_iter()
            .filter(|v| v != &Value::Object(serde_json::Map::new()))
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        if !records.is_empty() {
            let digest = render_digest(&records);
            mail(&digest.asciidoc, &digest.html);
        }
        let _ = fs::remove_file(&self.journal_path);
        Ok(())
    }
}

struct Digest {
    asciidoc: String,
    html: String,
}

/// message -> detail mode -> ordered timestamps.
type LeveledGroup = BTreeMap<String, BTreeMap<DetailMode, Vec<i64>>>;

fn group_leveled(records: &[RawRecord], level: i64) -> LeveledGroup {
    let mut groups: LeveledGroup = BTreeMap::new();
    for rec in records {
        if rec.level != level {
            continue;
        }
        let mode = DetailMode::from_tag(rec.detail.as_deref().unwrap_or("ALL"));
        groups
            .entry(rec.message.clone())
            .or_default()
            .entry(mode)
            .or_default()
            .push(rec.timestamp);
    }
    groups
}

fn render_time_cell(modes: &BTreeMap<DetailMode, Vec<i64>>) -> (String, usize) {
    let mut cell = String::new();
    let mut count = 0usize;
    for (mode, timestamps) in modes {
        count += timestamps.len();
        let fmt_ts = |t: &i64| {
            DateTime::<Utc>::from_timestamp(*t, 0)
                .map(|d| d.to_rfc3339())
                .unwrap_or_default()
        };
        let rendered = match mode {
            DetailMode::None => String::new(),
            DetailMode::First => format!("From : {}", fmt_ts(timestamps.first().unwrap())),
            DetailMode::Last => format!("Until: {}", fmt_ts(timestamps.last().unwrap())),
            DetailMode::FirstLast => {
                if timestamps.len() == 1 {
                    fmt_ts(&timestamps[0])
                } else {
                    format!(
                        "From : {}\nUntil: {}",
                        fmt_ts(timestamps.first().unwrap()),
                        fmt_ts(timestamps.last().unwrap())
                    )
                }
            }
            DetailMode::All => timestamps
                .iter()
                .map(fmt_ts)
                .collect::<Vec<_>>()
                .join("\n"),
        };
        if !rendered.is_empty() {
            if !cell.is_empty() {
                cell.push('\n');
            }
            cell.push_str(&rendered);
        }
    }
    (cell, count)
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn render_section_asciidoc(out: &mut String, title: &str, group: &LeveledGroup) {
    if group.is_empty() {
        return;
    }
    let _ = writeln!(out, "== {title}\n");
    let _ = writeln!(out, "[cols=\"1,1,3\"]\n|===");
    let _ = writeln!(out, "|Count|Time|Message\n");
    for (message, modes) in group {
        let (cell, count) = render_time_cell(modes);
        let _ = writeln!(out, "|{count}\n|{cell}\n|{message}\n");
    }
    let _ = writeln!(out, "|===\n");
}

fn render_section_html(out: &mut String, title: &str, group: &LeveledGroup) {
    if group.is_empty() {
        return;
    }
    let _ = writeln!(out, "<h2>{}</h2>", escape_html(title));
    let _ = writeln!(out, "<table border=\"1\">");
    let _ = writeln!(out, "<tr><th>Count</th><th>Time</th><th>Message</th></tr>");
    for (message, modes) in group {
        let (cell, count) = render_time_cell(modes);
        let _ = writeln!(
            out,
            "<tr><td>{count}</td><td>{}</td><td>{}</td></tr>",
            escape_html(&cell).replace('\n', "<br/>"),
            escape_html(message)
        );
    }
    let _ = writeln!(out, "</table>");
}

fn render_digest(records: &[RawRecord]) -> Digest {
    let warn_group = group_leveled(records, Level::Warn.as_i64());
    let info_group = group_leveled(records, Level::Info.as_i64());

    let mut others: Vec<(i64, String)> = records
        .iter()
        .filter(|r| r.level == Level::from_i64(0).as_i64())
        .map(|r| (r.timestamp, r.message.clone()))
        .collect();
    others.sort_by(|a, b| a.0.cmp(&b.0));

    let mut asciidoc = String::new();
    render_section_asciidoc(&mut asciidoc, "WARNING", &warn_group);
    render_section_asciidoc(&mut asciidoc, "Information", &info_group);
    if !others.is_empty() {
        let _ = writeln!(asciidoc, "== Other\n");
        for (ts, msg) in &others {
            let _ = writeln!(asciidoc, "* {}: {}", ts, msg);
        }
    }

    let mut html = String::from("<html><body>");
    render_section_html(&mut html, "WARNING", &warn_group);
    render_section_html(&mut html, "Information", &info_group);
    if !others.is_empty() {
        html.push_str("<h2>Other</h2><ul>");
        for (ts, msg) in &others {
            let _ = write!(html, "<li>{}: {}</li>", ts, escape_html(msg));
        }
        html.push_str("</ul>");
    }
    html.push_str("</body></html>");

    Digest { asciidoc, html }
}

/// The wall-clock hour the flush-on-wrap rule compares against: the host's
/// local timezone, not UTC, so the digest fires once per local calendar
/// day rather than once per UTC day.
pub fn local_hour_of(ts: DateTime<Utc>) -> u32 {
    ts.with_timezone(&Local).hour()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn three_warns_same_message_flush_with_count_three() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.journal");
        let mut agg = ReportAggregator::new(path);

        let mailed = RefCell::new(None);
        for i in 0..3 {
            agg.record(
                ReportRecord::new("WARN", None, "auth failure".to_string(), t(i)),
                10,
                |_ad, _html| panic!("should not flush yet"),
            )
            .unwrap();
        }
        agg.record(
            ReportRecord::new("INFO", None, "tick".to_string(), t(100)),
            5,
            |ad, html| {
                *mailed.borrow_mut() = Some((ad.to_string(), html.to_string()));
            },
        )
        .unwrap();

        let (asciidoc, html) = mailed.into_inner().expect("digest should have been mailed");
        assert!(asciidoc.contains("auth failure"));
        assert!(asciidoc.contains('3'));
        assert!(html.contains("auth failure"));
    }

    #[test]
    fn html_escapes_message_bodies() {
        let records = vec![RawRecord {
            level: Level::Warn.as_i64(),
            timestamp: 0,
            message: "<script>&alert</script>".to_string(),
            detail: None,
        }];
        let digest = render_digest(&records);
        assert!(digest.html.contains("&lt;script&gt;&amp;alert&lt;/script&gt;"));
    }
}
