//! Repeat domain library: spaced-repetition and periodic-review scheduling for Markdown notes.
//! The scheduling core is pure text-in/text-out; the store and projectors layer I/O and
//! review-queue views on top of it.

pub mod core {
    use chrono::{DateTime, FixedOffset, NaiveTime};
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeSet;

    /* ---------------------------- Field names ---------------------------- */

    pub const REPEAT_FIELD: &str = "repeat";
    pub const DUE_AT_FIELD: &str = "due_at";
    pub const HIDDEN_FIELD: &str = "hidden";

    /* ---------------------------- Vocabulary ----------------------------- */

    /// `Periodic` steps from the last due time; `Spaced` steps from "now".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum Strategy {
        Periodic,
        Spaced,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum PeriodUnit {
        Hour,
        Day,
        Week,
        Month,
        Year,
        /// Addresses named days of the week; `period` is ignored.
        Weekdays,
    }

    impl PeriodUnit {
        /// Nominal length of one unit in hours (months are 30 days, years 365).
        pub fn nominal_hours(self) -> i64 {
            match self {
                PeriodUnit::Hour => 1,
                PeriodUnit::Day => 24,
                PeriodUnit::Week | PeriodUnit::Weekdays => 24 * 7,
                PeriodUnit::Month => 24 * 30,
                PeriodUnit::Year => 24 * 365,
            }
        }
    }

    /// Which of the two configured review times a due date snaps to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum TimeOfDay {
        Am,
        Pm,
    }

    /// Day of the week, ordered Monday first so sets iterate in calendar order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Weekday {
        Monday,
        Tuesday,
        Wednesday,
        Thursday,
        Friday,
        Saturday,
        Sunday,
    }

    impl Weekday {
        pub const ALL: [Weekday; 7] = [
            Weekday::Monday,
            Weekday::Tuesday,
            Weekday::Wednesday,
            Weekday::Thursday,
            Weekday::Friday,
            Weekday::Saturday,
            Weekday::Sunday,
        ];

        /// Canonical lowercase name used in directives.
        pub fn name(self) -> &'static str {
            match self {
                Weekday::Monday => "monday",
                Weekday::Tuesday => "tuesday",
                Weekday::Wednesday => "wednesday",
                Weekday::Thursday => "thursday",
                Weekday::Friday => "friday",
                Weekday::Saturday => "saturday",
                Weekday::Sunday => "sunday",
            }
        }

        /// Capitalized name for labels.
        pub fn title(self) -> &'static str {
            match self {
                Weekday::Monday => "Monday",
                Weekday::Tuesday => "Tuesday",
                Weekday::Wednesday => "Wednesday",
                Weekday::Thursday => "Thursday",
                Weekday::Friday => "Friday",
                Weekday::Saturday => "Saturday",
                Weekday::Sunday => "Sunday",
            }
        }

        /// Resolve a lowercase day name or abbreviation.
        pub fn from_token(token: &str) -> Option<Self> {
            let day = match token.trim() {
                "monday" | "mon" => Weekday::Monday,
                "tuesday" | "tue" | "tues" => Weekday::Tuesday,
                "wednesday" | "wed" => Weekday::Wednesday,
                "thursday" | "thu" | "thur" | "thurs" => Weekday::Thursday,
                "friday" | "fri" => Weekday::Friday,
                "saturday" | "sat" => Weekday::Saturday,
                "sunday" | "sun" => Weekday::Sunday,
                _ => return None,
            };
            Some(day)
        }
    }

    impl From<chrono::Weekday> for Weekday {
        fn from(day: chrono::Weekday) -> Self {
            match day {
                chrono::Weekday::Mon => Weekday::Monday,
                chrono::Weekday::Tue => Weekday::Tuesday,
                chrono::Weekday::Wed => Weekday::Wednesday,
                chrono::Weekday::Thu => Weekday::Thursday,
                chrono::Weekday::Fri => Weekday::Friday,
                chrono::Weekday::Sat => Weekday::Saturday,
                chrono::Weekday::Sun => Weekday::Sunday,
            }
        }
    }

    /* ----------------------------- Descriptor ----------------------------- */

    /// A parsed `repeat` directive.
    ///
    /// Reconstructed from the note header on every read; never cached. Updated copies are
    /// built whole through the `with_*` methods.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ScheduleDescriptor {
        pub strategy: Strategy,
        /// Magnitude of one step; always > 0.
        pub period: u32,
        pub period_unit: PeriodUnit,
        pub time_of_day: TimeOfDay,
        /// Non-empty exactly when `period_unit` is `Weekdays`.
        #[serde(default)]
        pub weekdays: BTreeSet<Weekday>,
    }

    impl Default for ScheduleDescriptor {
        /// `spaced every 24 hours`.
        fn default() -> Self {
            Self::new(Strategy::Spaced, 24, PeriodUnit::Hour, TimeOfDay::Am)
        }
    }

    impl ScheduleDescriptor {
        pub fn new(
            strategy: Strategy,
            period: u32,
            period_unit: PeriodUnit,
            time_of_day: TimeOfDay,
        ) -> Self {
            Self {
                strategy,
                period,
                period_unit,
                time_of_day,
                weekdays: BTreeSet::new(),
            }
        }

        pub fn on_weekdays(
            strategy: Strategy,
            weekdays: impl IntoIterator<Item = Weekday>,
            time_of_day: TimeOfDay,
        ) -> Self {
            Self {
                strategy,
                period: 1,
                period_unit: PeriodUnit::Weekdays,
                time_of_day,
                weekdays: weekdays.into_iter().collect(),
            }
        }

        pub fn is_weekdays(&self) -> bool {
            self.period_unit == PeriodUnit::Weekdays
        }

        pub fn with_strategy(self, strategy: Strategy) -> Self {
            Self { strategy, ..self }
        }

        pub fn with_period(self, period: u32, period_unit: PeriodUnit) -> Self {
            let weekdays = if period_unit == PeriodUnit::Weekdays {
                self.weekdays
            } else {
                BTreeSet::new()
            };
            Self {
                period,
                period_unit,
                weekdays,
                ..self
            }
        }

        pub fn with_time_of_day(self, time_of_day: TimeOfDay) -> Self {
            Self {
                time_of_day,
                ..self
            }
        }

        /// Restore the descriptor invariants: positive period, and a non-empty weekday
        /// set (period 1) in weekday mode.
        pub fn repaired(mut self) -> Self {
            if self.period == 0 {
                self.period = 1;
            }
            if self.is_weekdays() {
                self.period = 1;
                if self.weekdays.is_empty() {
                    self.weekdays.insert(Weekday::Monday);
                }
            } else {
                self.weekdays.clear();
            }
            self
        }
    }

    /* ----------------------------- Repetition ----------------------------- */

    /// A descriptor plus the runtime state read from (or written to) a note header.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Repetition {
        #[serde(flatten)]
        pub schedule: ScheduleDescriptor,
        /// `None` means never scheduled; the engine treats it as already due.
        pub due_at: Option<DateTime<FixedOffset>>,
        pub hidden: bool,
        /// Synthesized for a note without a directive; never persisted as-is.
        #[serde(rename = "virtual")]
        pub is_virtual: bool,
    }

    impl Repetition {
        pub fn new(schedule: ScheduleDescriptor, due_at: Option<DateTime<FixedOffset>>) -> Self {
            Self {
                schedule,
                due_at,
                hidden: false,
                is_virtual: false,
            }
        }

        pub fn virtual_for(schedule: ScheduleDescriptor) -> Self {
            Self {
                is_virtual: true,
                ..Self::new(schedule, None)
            }
        }

        pub fn with_due_at(self, due_at: Option<DateTime<FixedOffset>>) -> Self {
            Self { due_at, ..self }
        }

        pub fn with_schedule(self, schedule: ScheduleDescriptor) -> Self {
            Self { schedule, ..self }
        }

        pub fn with_hidden(self, hidden: bool) -> Self {
            Self { hidden, ..self }
        }

        /// The state after a review: due at `due_at` and backed by a real directive.
        pub fn rescheduled(self, due_at: DateTime<FixedOffset>) -> Self {
            Self {
                due_at: Some(due_at),
                is_virtual: false,
                ..self
            }
        }
    }

    /// Wall-clock times that `Am`/`Pm` due dates snap to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReviewTimes {
        pub am: NaiveTime,
        pub pm: NaiveTime,
    }

    impl ReviewTimes {
        pub fn for_time_of_day(&self, time_of_day: TimeOfDay) -> NaiveTime {
            match time_of_day {
                TimeOfDay::Am => self.am,
                TimeOfDay::Pm => self.pm,
            }
        }
    }

    impl Default for ReviewTimes {
        fn default() -> Self {
            Self {
                am: NaiveTime::from_hms_opt(6, 0, 0).unwrap_or(NaiveTime::MIN),
                pm: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or(NaiveTime::MIN),
            }
        }
    }

    /* ------------------------------ Choices ------------------------------ */

    /// What selecting a review choice does to the note.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "kind", content = "repetition", rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum NextState {
        Reschedule(Repetition),
        /// Leave the note as it is.
        Dismiss,
        /// Turn repetition off for the note.
        Never,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RepeatChoice {
        pub label: String,
        pub next: NextState,
    }

    impl RepeatChoice {
        pub fn new(label: impl Into<String>, next: NextState) -> Self {
            Self {
                label: label.into(),
                next,
            }
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum HeaderError {
        #[error("could not create a metadata header for the note")]
        CouldNotCreateHeader,
    }
}

pub mod settings {
    //! User-facing configuration, loaded from a JSON file.

    use crate::core::{ReviewTimes, ScheduleDescriptor};
    use anyhow::{Context, Result};
    use chrono::NaiveTime;
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Settings {
        /// Time `Am` due dates snap to (`HH:MM`).
        #[serde(with = "serde_review_time")]
        pub morning_review_time: NaiveTime,
        /// Time `Pm` due dates snap to (`HH:MM`).
        #[serde(with = "serde_review_time")]
        pub evening_review_time: NaiveTime,
        /// Descriptor used when a directive cannot be parsed, and for virtual repetitions.
        #[serde(with = "serde_directive")]
        pub default_repeat: ScheduleDescriptor,
        /// Surface notes without a `repeat` field in the review queue.
        pub enqueue_non_repeating_notes: bool,
        /// Notes under this folder (relative to the store root) are never queued.
        pub ignore_folder_path: String,
    }

    impl Default for Settings {
        fn default() -> Self {
            let times = ReviewTimes::default();
            Self {
                morning_review_time: times.am,
                evening_review_time: times.pm,
                default_repeat: ScheduleDescriptor::default(),
                enqueue_non_repeating_notes: false,
                ignore_folder_path: String::new(),
            }
        }
    }

    impl Settings {
        pub fn review_times(&self) -> ReviewTimes {
            ReviewTimes {
                am: self.morning_review_time,
                pm: self.evening_review_time,
            }
        }

        pub fn from_json_str(text: &str) -> Result<Self, SettingsError> {
            Ok(serde_json::from_str(text)?)
        }

        pub fn load(path: &Path) -> Result<Self> {
            let text =
                fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            Self::from_json_str(&text).with_context(|| format!("parsing settings {:?}", path))
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum SettingsError {
        #[error("invalid settings: {0}")]
        Json(#[from] serde_json::Error),
    }

    mod serde_review_time {
        use chrono::NaiveTime;
        use serde::{Deserialize, Deserializer, Serializer, de::Error};

        const FORMAT: &str = "%H:%M";

        pub fn serialize<S>(value: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_str(&value.format(FORMAT))
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = String::deserialize(deserializer)?;
            NaiveTime::parse_from_str(raw.trim(), FORMAT)
                .map_err(|e| D::Error::custom(format!("review time {raw:?}: {e}")))
        }
    }

    mod serde_directive {
        use crate::core::ScheduleDescriptor;
        use crate::parser::parse_repeat;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(value: &ScheduleDescriptor, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_str(value)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<ScheduleDescriptor, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = String::deserialize(deserializer)?;
            Ok(parse_repeat(&raw, &ScheduleDescriptor::default()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{PeriodUnit, Strategy, TimeOfDay};

        #[test]
        fn missing_keys_fall_back_to_defaults() {
            let settings = Settings::from_json_str(r#"{"evening_review_time": "20:30"}"#)
                .expect("settings");
            assert_eq!(settings.review_times().am, NaiveTime::from_hms_opt(6, 0, 0).unwrap());
            assert_eq!(settings.review_times().pm, NaiveTime::from_hms_opt(20, 30, 0).unwrap());
            assert_eq!(settings.default_repeat, ScheduleDescriptor::default());
            assert!(!settings.enqueue_non_repeating_notes);
        }

        #[test]
        fn default_repeat_is_read_as_a_directive() {
            let settings = Settings::from_json_str(
                r#"{"default_repeat": "every 2 weeks in the evening", "enqueue_non_repeating_notes": true}"#,
            )
            .expect("settings");
            assert_eq!(
                settings.default_repeat,
                ScheduleDescriptor::new(Strategy::Periodic, 2, PeriodUnit::Week, TimeOfDay::Pm)
            );
            assert!(settings.enqueue_non_repeating_notes);

            let json = serde_json::to_string(&settings).expect("serialize");
            assert!(json.contains(r#""default_repeat":"every 2 weeks in the evening""#));
            assert!(json.contains(r#""morning_review_time":"06:00""#));
        }

        #[test]
        fn malformed_review_time_is_rejected() {
            let err = Settings::from_json_str(r#"{"morning_review_time": "25:00"}"#).unwrap_err();
            assert!(err.to_string().contains("review time"));
        }

        #[test]
        fn load_reads_settings_file() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("settings.json");
            fs::write(&path, r#"{"ignore_folder_path": "templates"}"#).expect("write");
            let settings = Settings::load(&path).expect("load");
            assert_eq!(settings.ignore_folder_path, "templates");
        }
    }
}

pub mod frontmatter {
    //! Text-region helpers for the leading `---` metadata header.
    //!
    //! Nothing here interprets YAML: the header is located by scanning delimiter lines and
    //! fields are located line by line, so every byte outside the edited line survives.

    use crate::core::HeaderError;
    use indexmap::IndexMap;
    use std::{borrow::Cow, ops::Range};
    use tracing::debug;

    const DELIMITER: &str = "---";

    /// Ordered field edits; `None` leaves the field untouched.
    pub type FieldUpdates = IndexMap<String, Option<String>>;

    /// Byte range of the header content, excluding the `---` delimiters.
    ///
    /// The header must open with `---` on the very first line. The content starts right
    /// after the three opening dashes and ends where the first closing line (three or more
    /// dashes, then whitespace or end of text) begins. With `include_delimiters`, the range
    /// spans from offset 0 through the closing dashes and their line break.
    pub fn frontmatter_bounds(content: &str, include_delimiters: bool) -> Option<Range<usize>> {
        let after_open = content.strip_prefix(DELIMITER)?;
        let open_break = line_break_len(after_open)?;
        let start = DELIMITER.len();

        let mut line_start = start + open_break;
        while line_start <= content.len() {
            let line = &content[line_start..];
            if let Some(close_len) = closing_delimiter_len(line) {
                return Some(if include_delimiters {
                    0..line_start + close_len
                } else {
                    start..line_start
                });
            }
            match line.find('\n') {
                Some(nl) => line_start += nl + 1,
                None => break,
            }
        }
        None
    }

    fn line_break_len(s: &str) -> Option<usize> {
        if s.starts_with("\r\n") {
            Some(2)
        } else if s.starts_with('\n') {
            Some(1)
        } else {
            None
        }
    }

    /// Length of the closing delimiter (dashes plus line break) at the start of `line`.
    fn closing_delimiter_len(line: &str) -> Option<usize> {
        let dashes = line.bytes().take_while(|b| *b == b'-').count();
        if dashes < DELIMITER.len() {
            return None;
        }
        let after = &line[dashes..];
        match after.chars().next() {
            None => Some(dashes),
            Some(c) if c.is_whitespace() => Some(dashes + line_break_len(after).unwrap_or(0)),
            Some(_) => None,
        }
    }

    /// The note body with the header (and its delimiters) cut away.
    pub fn strip_frontmatter(content: &str) -> &str {
        match frontmatter_bounds(content, true) {
            Some(range) => &content[range.end..],
            None => content,
        }
    }

    /// Range of the last `name: value` line for `field` in `header`, without its line break.
    ///
    /// Later duplicates win, matching how YAML loaders treat repeated keys.
    pub fn field_bounds(header: &str, field: &str) -> Option<Range<usize>> {
        let mut found = None;
        let mut offset = 0;
        for line in header.split_inclusive('\n') {
            let body = line.strip_suffix('\n').unwrap_or(line);
            let body = body.strip_suffix('\r').unwrap_or(body);
            if is_field_line(body, field) {
                found = Some(offset..offset + body.len());
            }
            offset += line.len();
        }
        found
    }

    fn is_field_line(line: &str, field: &str) -> bool {
        !field.is_empty()
            && line
                .strip_prefix(field)
                .is_some_and(|rest| rest.trim_start().starts_with(':'))
    }

    /// Trimmed value of `field`, with one layer of matching quotes removed.
    /// Empty values read as absent.
    pub fn field_value<'a>(header: &'a str, field: &str) -> Option<&'a str> {
        let line = &header[field_bounds(header, field)?];
        let (_, raw) = line.split_once(':')?;
        let value = raw.trim();
        let unquoted = ['"', '\'']
            .iter()
            .find_map(|q| value.strip_prefix(*q)?.strip_suffix(*q))
            .unwrap_or(value);
        Some(unquoted).filter(|v| !v.is_empty())
    }

    /// Replace the `field` line in place, or append one if the field is absent.
    pub fn replace_or_insert_field(header: &str, field: &str, value: &str) -> String {
        let line = format!("{field}: {value}");
        match field_bounds(header, field) {
            Some(range) => {
                let mut out = String::with_capacity(header.len() + line.len());
                out.push_str(&header[..range.start]);
                out.push_str(&line);
                out.push_str(&header[range.end..]);
                out
            }
            None => {
                let mut out = header.to_string();
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&line);
                out.push('\n');
                out
            }
        }
    }

    /// Apply `updates` to the note's header, creating an empty header first if needed.
    ///
    /// Offsets are recomputed against the accumulated header after every field, and the
    /// text before and after the header is spliced back untouched.
    pub fn apply_field_updates(
        content: &str,
        updates: &FieldUpdates,
    ) -> Result<String, HeaderError> {
        if updates.values().all(Option::is_none) {
            return Ok(content.to_string());
        }

        let (content, bounds) = match frontmatter_bounds(content, false) {
            Some(bounds) => (Cow::Borrowed(content), bounds),
            None => {
                debug!("note has no metadata header; creating an empty one");
                let synthesized = format!("{DELIMITER}\n{DELIMITER}\n{content}");
                let bounds = frontmatter_bounds(&synthesized, false)
                    .ok_or(HeaderError::CouldNotCreateHeader)?;
                (Cow::Owned(synthesized), bounds)
            }
        };

        let mut header = content[bounds.clone()].to_string();
        for (field, value) in updates {
            if let Some(value) = value {
                header = replace_or_insert_field(&header, field, value);
            }
        }

        let mut out = String::with_capacity(content.len() + header.len());
        out.push_str(&content[..bounds.start]);
        out.push_str(&header);
        out.push_str(&content[bounds.end..]);
        Ok(out)
    }

}

pub mod parser {
    //! Directive grammar built on `nom`, plus readers for the other header scalars.
    //!
    //! Parsing never fails: text that does not match the grammar resolves to the
    //! caller's default descriptor.

    use crate::core::*;
    use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::tag,
        character::complete::{char, digit1, space0, space1},
        combinator::{all_consuming, map, map_res, opt, value},
        error::VerboseError,
        sequence::{preceded, terminated, tuple},
    };
    use std::collections::BTreeSet;
    use tracing::debug;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------ Public entry points ------------------------ */

    /// Parse a `repeat` directive, falling back to `defaults` when it is not understood.
    pub fn parse_repeat(directive: &str, defaults: &ScheduleDescriptor) -> ScheduleDescriptor {
        let lowered = directive.trim().to_lowercase();
        let (body, strategy) = match spaced_prefix(&lowered) {
            Ok((rest, ())) => (rest, Strategy::Spaced),
            Err(_) => (lowered.as_str(), Strategy::Periodic),
        };

        if let Some(descriptor) = parse_weekday_form(body, strategy) {
            return descriptor;
        }

        if let Ok((suffix, (period, unit))) = unit_form(body) {
            let time_of_day = time_of_day_from_suffix(suffix);
            return ScheduleDescriptor::new(strategy, period, unit, time_of_day).repaired();
        }

        debug!(directive, "unrecognized repeat directive; using the configured default");
        let fallback = defaults.clone().repaired();
        match strategy {
            Strategy::Spaced => fallback.with_strategy(Strategy::Spaced),
            Strategy::Periodic => fallback,
        }
    }

    /// `n`, `no`, `false`, `off` and `never` explicitly turn repetition off.
    pub fn is_repeat_disabled(value: &str) -> bool {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "n" | "no" | "false" | "off" | "never"
        )
    }

    /// YAML-style truthiness: `y`, `yes`, `true`, `on`.
    pub fn parse_yaml_boolean(value: Option<&str>) -> bool {
        value.is_some_and(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "y" | "yes" | "true" | "on"
            )
        })
    }

    /// Parse a `due_at` value. Timestamps without an offset are read in `offset`.
    pub fn parse_due_at(value: &str, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
        let value = value.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
            return Some(parsed);
        }
        const NAIVE_FORMATS: [&str; 5] = [
            "%Y-%m-%dT%H:%M:%S",
            "%Y-%m-%dT%H:%M:%S%.f",
            "%Y-%m-%dT%H:%M",
            "%Y-%m-%d %H:%M:%S",
            "%Y-%m-%d %H:%M",
        ];
        let naive = NAIVE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
            .or_else(|| {
                NaiveDate::parse_from_str(value, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })?;
        offset.from_local_datetime(&naive).single()
    }

    /* ------------------------------ Grammar ------------------------------ */

    fn spaced_prefix(i: &str) -> PResult<'_, ()> {
        value((), terminated(tag("spaced"), space0))(i)
    }

    fn every_prefix(i: &str) -> PResult<'_, &str> {
        terminated(tag("every"), space1)(i)
    }

    fn parse_weekday_form(body: &str, strategy: Strategy) -> Option<ScheduleDescriptor> {
        let (rest, _) = every_prefix(body).ok()?;
        let (list, time_of_day) = split_time_of_day_suffix(rest);
        let weekdays = parse_weekday_list(list);
        if weekdays.is_empty() {
            return None;
        }
        Some(ScheduleDescriptor::on_weekdays(
            strategy,
            weekdays,
            time_of_day.unwrap_or(TimeOfDay::Am),
        ))
    }

    /// Split `mon, wed in the evening` into the day list and its time-of-day suffix.
    fn split_time_of_day_suffix(i: &str) -> (&str, Option<TimeOfDay>) {
        for (idx, c) in i.char_indices() {
            if !c.is_whitespace() {
                continue;
            }
            let (head, tail) = i.split_at(idx);
            if head.trim().is_empty() {
                continue;
            }
            if let Ok((_, time_of_day)) = all_consuming(time_of_day_suffix)(tail.trim()) {
                return (head.trim_end(), Some(time_of_day));
            }
        }
        (i.trim_end(), None)
    }

    fn time_of_day_suffix(i: &str) -> PResult<'_, TimeOfDay> {
        alt((
            preceded(
                tuple((tag("in"), space1, tag("the"), space1)),
                alt((
                    value(TimeOfDay::Am, tag("morning")),
                    value(TimeOfDay::Pm, tag("evening")),
                )),
            ),
            value(TimeOfDay::Am, tag("am")),
            value(TimeOfDay::Pm, tag("pm")),
        ))(i)
    }

    /// Days separated by `,`, `&` or `and`; unknown tokens are dropped.
    fn parse_weekday_list(list: &str) -> BTreeSet<Weekday> {
        let mut days = BTreeSet::new();
        for chunk in list.split([',', '&']) {
            let words: Vec<&str> = chunk.split_whitespace().collect();
            for group in words.split(|w| *w == "and") {
                if let Some(day) = Weekday::from_token(&group.join(" ")) {
                    days.insert(day);
                }
            }
        }
        days
    }

    fn unit_form(i: &str) -> PResult<'_, (u32, PeriodUnit)> {
        alt((shorthand, every_unit))(i)
    }

    fn shorthand(i: &str) -> PResult<'_, (u32, PeriodUnit)> {
        map(
            alt((
                value(PeriodUnit::Day, tag("daily")),
                value(PeriodUnit::Week, tag("weekly")),
                value(PeriodUnit::Month, tag("monthly")),
                value(PeriodUnit::Year, tag("yearly")),
                value(PeriodUnit::Year, tag("annually")),
            )),
            |unit| (1, unit),
        )(i)
    }

    fn every_unit(i: &str) -> PResult<'_, (u32, PeriodUnit)> {
        let (i, _) = every_prefix(i)?;
        let (i, period) = opt(terminated(
            map_res(digit1, |s: &str| s.parse::<u32>()),
            space1,
        ))(i)?;
        let (i, unit) = period_unit(i)?;
        let (i, _) = opt(char('s'))(i)?;
        Ok((i, (period.unwrap_or(1), unit)))
    }

    fn period_unit(i: &str) -> PResult<'_, PeriodUnit> {
        alt((
            value(PeriodUnit::Hour, tag("hour")),
            value(PeriodUnit::Day, tag("day")),
            value(PeriodUnit::Week, tag("week")),
            value(PeriodUnit::Month, tag("month")),
            value(PeriodUnit::Year, tag("year")),
        ))(i)
    }

    fn time_of_day_from_suffix(suffix: &str) -> TimeOfDay {
        let normalized = suffix.split_whitespace().collect::<Vec<_>>().join(" ");
        match normalized.as_str() {
            "in the evening" | "pm" => TimeOfDay::Pm,
            _ => TimeOfDay::Am,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn periodic(period: u32, unit: PeriodUnit, tod: TimeOfDay) -> ScheduleDescriptor {
            ScheduleDescriptor::new(Strategy::Periodic, period, unit, tod)
        }

        fn parse(directive: &str) -> ScheduleDescriptor {
            parse_repeat(directive, &ScheduleDescriptor::default())
        }

        #[test]
        fn shorthand_literals() {
            assert_eq!(parse("daily"), periodic(1, PeriodUnit::Day, TimeOfDay::Am));
            assert_eq!(parse("Weekly"), periodic(1, PeriodUnit::Week, TimeOfDay::Am));
            assert_eq!(parse("monthly"), periodic(1, PeriodUnit::Month, TimeOfDay::Am));
            assert_eq!(parse("yearly"), periodic(1, PeriodUnit::Year, TimeOfDay::Am));
            assert_eq!(parse("ANNUALLY"), periodic(1, PeriodUnit::Year, TimeOfDay::Am));
            assert_eq!(parse("daily pm"), periodic(1, PeriodUnit::Day, TimeOfDay::Pm));
        }

        #[test]
        fn unit_forms_with_suffixes() {
            for (unit_text, unit) in [
                ("day", PeriodUnit::Day),
                ("week", PeriodUnit::Week),
                ("month", PeriodUnit::Month),
                ("year", PeriodUnit::Year),
            ] {
                assert_eq!(parse(&format!("every {unit_text}")), periodic(1, unit, TimeOfDay::Am));
                assert_eq!(
                    parse(&format!("every {unit_text} in the morning")),
                    periodic(1, unit, TimeOfDay::Am)
                );
                assert_eq!(
                    parse(&format!("every {unit_text} in the evening")),
                    periodic(1, unit, TimeOfDay::Pm)
                );
                assert_eq!(parse(&format!("every {unit_text} am")), periodic(1, unit, TimeOfDay::Am));
                assert_eq!(parse(&format!("every {unit_text} pm")), periodic(1, unit, TimeOfDay::Pm));
            }
            assert_eq!(
                parse("every 20 weeks in the morning"),
                periodic(20, PeriodUnit::Week, TimeOfDay::Am)
            );
            assert_eq!(parse("every 3 days"), periodic(3, PeriodUnit::Day, TimeOfDay::Am));
        }

        #[test]
        fn zero_period_is_repaired() {
            assert_eq!(parse("every 0 days"), periodic(1, PeriodUnit::Day, TimeOfDay::Am));
        }

        #[test]
        fn spaced_prefix_selects_spaced_strategy() {
            assert_eq!(
                parse("spaced every 20 hours in the evening"),
                ScheduleDescriptor::new(Strategy::Spaced, 20, PeriodUnit::Hour, TimeOfDay::Pm)
            );
            assert_eq!(
                parse("Spaced Every Hour"),
                ScheduleDescriptor::new(Strategy::Spaced, 1, PeriodUnit::Hour, TimeOfDay::Am)
            );
        }

        #[test]
        fn weekday_lists() {
            let parsed = parse("every mon, wed, fri");
            assert_eq!(parsed.period_unit, PeriodUnit::Weekdays);
            assert_eq!(parsed.period, 1);
            assert_eq!(
                parsed.weekdays.iter().copied().collect::<Vec<_>>(),
                vec![Weekday::Monday, Weekday::Wednesday, Weekday::Friday]
            );

            let parsed = parse("every Tuesday and Thursday");
            assert_eq!(
                parsed.weekdays.iter().copied().collect::<Vec<_>>(),
                vec![Weekday::Tuesday, Weekday::Thursday]
            );
            assert_eq!(parsed.time_of_day, TimeOfDay::Am);

            let parsed = parse("every tues & thurs in the evening");
            assert_eq!(
                parsed.weekdays.iter().copied().collect::<Vec<_>>(),
                vec![Weekday::Tuesday, Weekday::Thursday]
            );
            assert_eq!(parsed.time_of_day, TimeOfDay::Pm);

            assert_eq!(parse("every sat pm").time_of_day, TimeOfDay::Pm);
        }

        #[test]
        fn weekday_list_keeps_strategy_and_drops_unknown_tokens() {
            let parsed = parse("spaced every mon, someday, sun");
            assert_eq!(parsed.strategy, Strategy::Spaced);
            assert_eq!(
                parsed.weekdays.iter().copied().collect::<Vec<_>>(),
                vec![Weekday::Monday, Weekday::Sunday]
            );
        }

        #[test]
        fn unparsable_directives_use_defaults() {
            let defaults = periodic(2, PeriodUnit::Week, TimeOfDay::Pm);
            assert_eq!(parse_repeat("whenever", &defaults), defaults);
            assert_eq!(parse_repeat("every blursday", &defaults), defaults);
            assert_eq!(
                parse_repeat("spaced", &defaults),
                defaults.clone().with_strategy(Strategy::Spaced)
            );
            assert_eq!(
                parse("spaced"),
                ScheduleDescriptor::new(Strategy::Spaced, 24, PeriodUnit::Hour, TimeOfDay::Am)
            );
        }

        #[test]
        fn disabled_sentinels() {
            for value in ["n", "No", "FALSE", "off", "never", " never "] {
                assert!(is_repeat_disabled(value), "{value}");
            }
            for value in ["", "nope", "daily", "every never"] {
                assert!(!is_repeat_disabled(value), "{value}");
            }
        }

        #[test]
        fn yaml_booleans() {
            for value in ["y", "yes", "true", "on", "True"] {
                assert!(parse_yaml_boolean(Some(value)), "{value}");
            }
            assert!(!parse_yaml_boolean(Some("false")));
            assert!(!parse_yaml_boolean(Some("maybe")));
            assert!(!parse_yaml_boolean(None));
        }

        #[test]
        fn due_at_accepts_rfc3339_and_naive_timestamps() {
            let offset = FixedOffset::west_opt(5 * 3600).unwrap();
            let parsed = parse_due_at("2022-03-04T06:00:00.000-05:00", offset).expect("rfc3339");
            assert_eq!(parsed.to_rfc3339(), "2022-03-04T06:00:00-05:00");

            let naive = parse_due_at("2022-03-04T06:00", offset).expect("naive");
            assert_eq!(naive, parsed);

            let date_only = parse_due_at("2022-03-04", offset).expect("date");
            assert_eq!(date_only.to_rfc3339(), "2022-03-04T00:00:00-05:00");

            assert_eq!(parse_due_at("tomorrow", offset), None);
            assert_eq!(parse_due_at("", offset), None);
        }
    }
}

pub mod format {
    //! Rendering of descriptors and next states back into header fields.

    use crate::core::*;
    use crate::frontmatter::FieldUpdates;
    use chrono::{DateTime, FixedOffset, SecondsFormat};
    use std::fmt;

    impl fmt::Display for ScheduleDescriptor {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let spaced = self.strategy == Strategy::Spaced;
            let evening = self.time_of_day == TimeOfDay::Pm;

            if self.is_weekdays() {
                let days = self
                    .weekdays
                    .iter()
                    .map(|d| d.name())
                    .collect::<Vec<_>>()
                    .join(", ");
                if spaced {
                    f.write_str("spaced ")?;
                }
                write!(f, "every {days}")?;
                if evening {
                    f.write_str(" in the evening")?;
                }
                return Ok(());
            }

            if !spaced && !evening && self.period == 1 {
                if let Some(shorthand) = shorthand(self.period_unit) {
                    return f.write_str(shorthand);
                }
            }

            let mut parts = Vec::with_capacity(5);
            if spaced {
                parts.push("spaced".to_string());
            }
            parts.push("every".to_string());
            if self.period != 1 {
                parts.push(self.period.to_string());
            }
            let suffix = if self.period == 1 { "" } else { "s" };
            parts.push(format!("{}{suffix}", unit_name(self.period_unit)));
            if evening {
                parts.push("in the evening".to_string());
            }
            f.write_str(&parts.join(" "))
        }
    }

    fn shorthand(unit: PeriodUnit) -> Option<&'static str> {
        match unit {
            PeriodUnit::Day => Some("daily"),
            PeriodUnit::Week => Some("weekly"),
            PeriodUnit::Month => Some("monthly"),
            PeriodUnit::Year => Some("yearly"),
            PeriodUnit::Hour | PeriodUnit::Weekdays => None,
        }
    }

    fn unit_name(unit: PeriodUnit) -> &'static str {
        match unit {
            PeriodUnit::Hour => "hour",
            PeriodUnit::Day => "day",
            PeriodUnit::Week | PeriodUnit::Weekdays => "week",
            PeriodUnit::Month => "month",
            PeriodUnit::Year => "year",
        }
    }

    pub fn format_due_at(due_at: &DateTime<FixedOffset>) -> String {
        due_at.to_rfc3339_opts(SecondsFormat::Secs, false)
    }

    /// Header edits that persist `next`: `repeat`, `due_at` and `hidden`, in that order.
    pub fn serialize_next_state(next: &NextState) -> FieldUpdates {
        let (repeat, due_at, hidden) = match next {
            NextState::Reschedule(repetition) => (
                Some(repetition.schedule.to_string()),
                repetition.due_at.as_ref().map(format_due_at),
                Some(repetition.hidden.to_string()),
            ),
            NextState::Never => (Some("never".to_string()), None, None),
            NextState::Dismiss => (None, None, None),
        };
        FieldUpdates::from([
            (REPEAT_FIELD.to_string(), repeat),
            (DUE_AT_FIELD.to_string(), due_at),
            (HIDDEN_FIELD.to_string(), hidden),
        ])
    }

}

pub mod engine {
    //! Due-date advancement.
    //!
    //! The engine trusts its input: descriptors come from the grammar, which repairs
    //! degenerate periods and weekday sets before they get here.

    use crate::core::*;
    use chrono::{DateTime, Datelike, Duration, FixedOffset, Months, NaiveTime, TimeZone};
    use tracing::trace;

    /// Spaced hourly schedules only snap to a review time this far out.
    pub const SNAP_THRESHOLD_DAYS: i64 = 7;

    /// Next due time for `schedule`, never earlier than `reference`.
    ///
    /// Weekday schedules pick the first matching day after `reference`. Everything else
    /// steps forward from `due_at` (or from just before `reference` when the note was
    /// never scheduled) by as many periods as it takes to catch up, then snaps to the
    /// configured review time.
    pub fn advance(
        schedule: &ScheduleDescriptor,
        due_at: Option<DateTime<FixedOffset>>,
        reference: DateTime<FixedOffset>,
        times: &ReviewTimes,
    ) -> DateTime<FixedOffset> {
        let review_time = times.for_time_of_day(schedule.time_of_day);
        if schedule.is_weekdays() {
            return next_weekday(schedule, reference, review_time);
        }

        let due = due_at.unwrap_or(reference - Duration::seconds(1));
        let steps = if due <= reference {
            steps_to_catch_up(schedule, due, reference)
        } else {
            1
        };
        let stepped = add_periods(due, schedule.period_unit, schedule.period.saturating_mul(steps))
            .unwrap_or(reference);

        let mut next = if keeps_exact_time(schedule, stepped, reference) {
            stepped
        } else {
            snap_to_review_time(stepped, review_time)
        };
        while next < reference {
            next += Duration::days(1);
        }
        trace!(%due, %reference, steps, %next, "advanced schedule");
        next
    }

    /// Move `at` to `time` on the same calendar day, in its own offset.
    pub fn snap_to_review_time(at: DateTime<FixedOffset>, time: NaiveTime) -> DateTime<FixedOffset> {
        at.offset()
            .from_local_datetime(&at.date_naive().and_time(time))
            .single()
            .unwrap_or(at)
    }

    fn next_weekday(
        schedule: &ScheduleDescriptor,
        reference: DateTime<FixedOffset>,
        review_time: NaiveTime,
    ) -> DateTime<FixedOffset> {
        for days_ahead in 1..=7 {
            let candidate = reference + Duration::days(days_ahead);
            if schedule.weekdays.contains(&Weekday::from(candidate.weekday())) {
                return snap_to_review_time(candidate, review_time);
            }
        }
        snap_to_review_time(reference + Duration::days(1), review_time)
    }

    /// Whole periods needed to move `due` past `reference` (at least one).
    fn steps_to_catch_up(
        schedule: &ScheduleDescriptor,
        due: DateTime<FixedOffset>,
        reference: DateTime<FixedOffset>,
    ) -> u32 {
        let elapsed = (reference - due).num_milliseconds();
        let period = i64::from(schedule.period)
            .saturating_mul(schedule.period_unit.nominal_hours())
            .saturating_mul(3_600_000)
            .max(1);
        let steps = elapsed.div_euclid(period) + i64::from(elapsed.rem_euclid(period) != 0);
        u32::try_from(steps.max(1)).unwrap_or(u32::MAX)
    }

    /// Calendar length of one period of `schedule` starting at `from`.
    ///
    /// Months and years follow the calendar, so a month from January 5th is 31 days.
    pub fn period_span(
        schedule: &ScheduleDescriptor,
        from: DateTime<FixedOffset>,
    ) -> Option<Duration> {
        add_periods(from, schedule.period_unit, schedule.period).map(|end| end - from)
    }

    fn add_periods(
        from: DateTime<FixedOffset>,
        unit: PeriodUnit,
        count: u32,
    ) -> Option<DateTime<FixedOffset>> {
        let count64 = i64::from(count);
        match unit {
            PeriodUnit::Hour => from.checked_add_signed(Duration::hours(count64)),
            PeriodUnit::Day => from.checked_add_signed(Duration::days(count64)),
            PeriodUnit::Week | PeriodUnit::Weekdays => {
                from.checked_add_signed(Duration::weeks(count64))
            }
            PeriodUnit::Month => from.checked_add_months(Months::new(count)),
            PeriodUnit::Year => from.checked_add_months(Months::new(count.checked_mul(12)?)),
        }
    }

    fn keeps_exact_time(
        schedule: &ScheduleDescriptor,
        stepped: DateTime<FixedOffset>,
        reference: DateTime<FixedOffset>,
    ) -> bool {
        schedule.strategy == Strategy::Spaced
            && schedule.period_unit == PeriodUnit::Hour
            && stepped - reference < Duration::days(SNAP_THRESHOLD_DAYS)
    }

}

pub mod summary {
    //! Human-readable relative-time summaries ("2 days and 4 hours", "a moment").

    use chrono::{DateTime, Datelike, FixedOffset, Months};

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    struct CalendarDiff {
        years: i64,
        months: i64,
        days: i64,
        hours: i64,
        minutes: i64,
        seconds: i64,
    }

    /// Calendar-aware difference: whole months first, then the exact remainder.
    fn calendar_diff(a: DateTime<FixedOffset>, b: DateTime<FixedOffset>) -> CalendarDiff {
        let (earlier, later) = if a <= b { (a, b) } else { (b, a) };
        let shifted = |months: i64| {
            u32::try_from(months)
                .ok()
                .and_then(|m| earlier.checked_add_months(Months::new(m)))
        };

        let mut months = i64::from(later.year() - earlier.year()) * 12
            + i64::from(later.month())
            - i64::from(earlier.month());
        while months > 0 && shifted(months).is_none_or(|s| s > later) {
            months -= 1;
        }
        let anchor = shifted(months.max(0)).unwrap_or(earlier);
        let rest = later - anchor;

        CalendarDiff {
            years: months.max(0) / 12,
            months: months.max(0) % 12,
            days: rest.num_days(),
            hours: rest.num_hours() % 24,
            minutes: rest.num_minutes() % 60,
            seconds: rest.num_seconds() % 60,
        }
    }

    /// Succinct summary of the distance between `due_at` and `now`, in either direction.
    pub fn summarize_due_at(due_at: DateTime<FixedOffset>, now: DateTime<FixedOffset>) -> String {
        let diff = calendar_diff(due_at, now);
        let units: Vec<(i64, &str)> = if diff.years > 0 {
            vec![(diff.years, "year"), (diff.months, "month")]
        } else if diff.months > 0 {
            vec![(diff.months, "month"), (diff.days, "day")]
        } else if diff.days > 0 {
            if diff.days < 7 {
                vec![(diff.days, "day"), (diff.hours, "hour")]
            } else {
                vec![(diff.days, "day")]
            }
        } else if diff.hours > 0 {
            if diff.hours < 12 {
                vec![(diff.hours, "hour"), (diff.minutes, "minute")]
            } else {
                vec![(diff.hours, "hour")]
            }
        } else if diff.minutes > 0 {
            vec![(diff.minutes, "minute")]
        } else {
            return "a moment".to_string();
        };

        let pieces: Vec<String> = units
            .into_iter()
            .filter(|(value, _)| *value != 0)
            .map(|(value, unit)| {
                if value == 1 {
                    format!("{value} {unit}")
                } else {
                    format!("{value} {unit}s")
                }
            })
            .collect();
        match pieces.as_slice() {
            [] => "a moment".to_string(),
            [only] => only.clone(),
            [first, second, ..] => format!("{first} and {second}"),
        }
    }

    /// "Due in …" or "Overdue by …".
    pub fn fully_summarize_due_at(
        due_at: DateTime<FixedOffset>,
        now: DateTime<FixedOffset>,
    ) -> String {
        let summary = summarize_due_at(due_at, now);
        if due_at > now {
            format!("Due in {summary}")
        } else {
            format!("Overdue by {summary}")
        }
    }

}

pub mod choices {
    //! Review choices: the actions offered for a due note.

    use crate::core::*;
    use crate::engine::{SNAP_THRESHOLD_DAYS, advance, period_span, snap_to_review_time};
    use crate::settings::Settings;
    use crate::summary::summarize_due_at;
    use chrono::{DateTime, Datelike, Duration, FixedOffset};
    use std::collections::HashSet;

    pub const SKIP_MINUTES: i64 = 5;
    pub const SPACED_MULTIPLIERS: [f64; 4] = [0.5, 1.0, 1.5, 2.0];
    pub const DISMISS_LABEL: &str = "Dismiss";
    pub const NEVER_LABEL: &str = "Never";
    /// Upper bound on a spaced interval (100 years).
    const MAX_SPACED_HOURS: i64 = 24 * 365 * 100;

    /// Ordered choices for `repetition` at `now`.
    ///
    /// Anything not yet due gets a single `Dismiss`. Due periodic and weekday schedules get
    /// skip + advance; due spaced schedules get skip + four multiplier choices. Virtual
    /// repetitions can additionally be turned off with `Never`.
    pub fn get_choices(
        repetition: Option<&Repetition>,
        settings: &Settings,
        now: DateTime<FixedOffset>,
    ) -> Vec<RepeatChoice> {
        let Some(repetition) = repetition else {
            return vec![dismiss()];
        };
        let Some(due_at) = repetition.due_at else {
            return vec![dismiss()];
        };
        if due_at > now {
            return vec![dismiss()];
        }

        let schedule = &repetition.schedule;
        let mut choices = if schedule.is_weekdays() || schedule.strategy == Strategy::Periodic {
            periodic_choices(repetition, due_at, settings, now)
        } else {
            spaced_choices(repetition, settings, now)
        };

        if repetition.is_virtual && settings.enqueue_non_repeating_notes {
            choices.push(RepeatChoice::new(NEVER_LABEL, NextState::Never));
        }
        choices
    }

    fn dismiss() -> RepeatChoice {
        RepeatChoice::new(DISMISS_LABEL, NextState::Dismiss)
    }

    fn skip(repetition: &Repetition, now: DateTime<FixedOffset>) -> RepeatChoice {
        let next = now + Duration::minutes(SKIP_MINUTES);
        RepeatChoice::new(
            format!("Skip {}", summarize_due_at(next, now)),
            NextState::Reschedule(repetition.clone().rescheduled(next)),
        )
    }

    fn periodic_choices(
        repetition: &Repetition,
        due_at: DateTime<FixedOffset>,
        settings: &Settings,
        now: DateTime<FixedOffset>,
    ) -> Vec<RepeatChoice> {
        let next = advance(
            &repetition.schedule,
            Some(due_at),
            now,
            &settings.review_times(),
        );
        let label = if repetition.schedule.is_weekdays() {
            weekday_label(next, now)
        } else {
            summarize_due_at(next, now)
        };
        vec![
            skip(repetition, now),
            RepeatChoice::new(label, NextState::Reschedule(repetition.clone().rescheduled(next))),
        ]
    }

    fn weekday_label(next: DateTime<FixedOffset>, now: DateTime<FixedOffset>) -> String {
        let day = Weekday::from(next.weekday()).title();
        if next.iso_week() == now.iso_week() {
            day.to_string()
        } else {
            format!("next {day}")
        }
    }

    fn spaced_choices(
        repetition: &Repetition,
        settings: &Settings,
        now: DateTime<FixedOffset>,
    ) -> Vec<RepeatChoice> {
        let schedule = &repetition.schedule;
        let base_hours = period_span(schedule, now)
            .map(|span| span.num_hours())
            .unwrap_or_else(|| {
                i64::from(schedule.period).saturating_mul(schedule.period_unit.nominal_hours())
            });
        let review_time = settings.review_times().for_time_of_day(schedule.time_of_day);

        let mut choices = vec![skip(repetition, now)];
        for multiplier in SPACED_MULTIPLIERS {
            let hours = ((multiplier * base_hours as f64).round() as i64).clamp(1, MAX_SPACED_HOURS);
            let mut next = now + Duration::hours(hours);
            if hours >= SNAP_THRESHOLD_DAYS * 24 {
                next = snap_to_review_time(next, review_time);
            }
            let period = u32::try_from(hours).unwrap_or(u32::MAX);
            let next_repetition = repetition
                .clone()
                .with_schedule(schedule.clone().with_period(period, PeriodUnit::Hour))
                .rescheduled(next);
            choices.push(RepeatChoice::new(
                format!("{} (x{multiplier})", summarize_due_at(next, now)),
                NextState::Reschedule(next_repetition),
            ));
        }

        let mut seen = HashSet::new();
        choices.retain(|choice| seen.insert(choice.label.clone()));
        choices
    }

}

pub mod note {
    //! Reading a note's schedule from its header and writing the next state back.

    use crate::core::*;
    use crate::engine::advance;
    use crate::format::serialize_next_state;
    use crate::frontmatter::{apply_field_updates, field_value, frontmatter_bounds};
    use crate::parser::{is_repeat_disabled, parse_due_at, parse_repeat, parse_yaml_boolean};
    use crate::settings::Settings;
    use chrono::{DateTime, FixedOffset};

    /// What a note's header says about repetition.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum NoteSchedule {
        Scheduled(Repetition),
        /// `repeat` is set to an explicit off value such as `never`.
        Disabled,
        /// No directive, and non-repeating notes are not enqueued.
        Unscheduled,
    }

    impl NoteSchedule {
        pub fn repetition(&self) -> Option<&Repetition> {
            match self {
                NoteSchedule::Scheduled(repetition) => Some(repetition),
                NoteSchedule::Disabled | NoteSchedule::Unscheduled => None,
            }
        }

        pub fn into_repetition(self) -> Option<Repetition> {
            match self {
                NoteSchedule::Scheduled(repetition) => Some(repetition),
                NoteSchedule::Disabled | NoteSchedule::Unscheduled => None,
            }
        }
    }

    /// Read the schedule fields of `content`. Naive `due_at` values are read in `offset`.
    pub fn read_note(content: &str, settings: &Settings, offset: FixedOffset) -> NoteSchedule {
        let header = frontmatter_bounds(content, false)
            .map(|range| &content[range])
            .unwrap_or("");

        match field_value(header, REPEAT_FIELD) {
            Some(directive) if is_repeat_disabled(directive) => NoteSchedule::Disabled,
            Some(directive) => {
                let schedule = parse_repeat(directive, &settings.default_repeat);
                let due_at = field_value(header, DUE_AT_FIELD).and_then(|v| parse_due_at(v, offset));
                let hidden = parse_yaml_boolean(field_value(header, HIDDEN_FIELD));
                NoteSchedule::Scheduled(Repetition::new(schedule, due_at).with_hidden(hidden))
            }
            None if settings.enqueue_non_repeating_notes => NoteSchedule::Scheduled(
                Repetition::virtual_for(settings.default_repeat.clone()),
            ),
            None => NoteSchedule::Unscheduled,
        }
    }

    /// Persist the selected choice into the note text.
    pub fn apply_choice(content: &str, next: &NextState) -> Result<String, HeaderError> {
        apply_field_updates(content, &serialize_next_state(next))
    }

    /// The repetition to review at `now`. A note that was never scheduled is due right away.
    pub fn due_repetition(
        content: &str,
        settings: &Settings,
        now: DateTime<FixedOffset>,
    ) -> Option<Repetition> {
        let repetition = read_note(content, settings, *now.offset()).into_repetition()?;
        let due_at = repetition.due_at.unwrap_or(now);
        Some(repetition.with_due_at(Some(due_at)))
    }

    /// Give a note a fresh directive, first due one period from `now`.
    pub fn schedule_note(
        content: &str,
        schedule: ScheduleDescriptor,
        settings: &Settings,
        now: DateTime<FixedOffset>,
    ) -> Result<String, HeaderError> {
        let due_at = advance(&schedule, Some(now), now, &settings.review_times());
        apply_choice(
            content,
            &NextState::Reschedule(Repetition::new(schedule, Some(due_at))),
        )
    }

}

pub mod review {
    //! Read-model for the review queue.

    use crate::core::Repetition;
    use serde::Serialize;
    use std::path::PathBuf;

    /// A due note as shown in the review queue.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ReviewItem {
        /// Path relative to the store root.
        pub path: PathBuf,
        /// The note's repetition; `due_at` is always set.
        pub repetition: Repetition,
        /// "Due in …" / "Overdue by …".
        pub summary: String,
    }
}

pub mod storage {
    //! Note storage. The scheduling core never touches it; projectors and the CLI do.

    use anyhow::{Context, Result};
    use std::{
        collections::HashSet,
        fs,
        path::{Path, PathBuf},
    };
    use tracing::debug;

    pub const NOTE_EXTENSION: &str = "md";

    pub trait NoteStore {
        /// Paths of every note, relative to the store root, sorted.
        fn list(&self) -> Result<Vec<PathBuf>>;

        fn read(&self, rel_path: &Path) -> Result<String>;

        /// Replace a note's full text.
        fn write(&self, rel_path: &Path, content: &str) -> Result<()>;
    }

    /// Markdown notes in a directory tree.
    #[derive(Debug, Clone)]
    pub struct FsNoteStore {
        root: PathBuf,
    }

    impl FsNoteStore {
        pub fn new(root: impl AsRef<Path>) -> Result<Self> {
            let root = root.as_ref();
            let root =
                fs::canonicalize(root).with_context(|| format!("resolving path {:?}", root))?;
            if !root.is_dir() {
                anyhow::bail!("{:?} is not a directory", root);
            }
            Ok(Self { root })
        }

        pub fn root(&self) -> &Path {
            &self.root
        }
    }

    impl NoteStore for FsNoteStore {
        fn list(&self) -> Result<Vec<PathBuf>> {
            let mut out = Vec::new();
            let mut visited = HashSet::new();
            visit_dir(&self.root, &mut out, &mut visited)?;
            let mut rel: Vec<PathBuf> = out
                .into_iter()
                .filter_map(|p| p.strip_prefix(&self.root).ok().map(Path::to_path_buf))
                .collect();
            rel.sort();
            rel.dedup();
            Ok(rel)
        }

        fn read(&self, rel_path: &Path) -> Result<String> {
            let path = self.root.join(rel_path);
            fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))
        }

        fn write(&self, rel_path: &Path, content: &str) -> Result<()> {
            let path = self.root.join(rel_path);
            fs::write(&path, content.as_bytes()).with_context(|| format!("writing {:?}", path))
        }
    }

    fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
        let canonical = fs::canonicalize(path).with_context(|| format!("resolving {:?}", path))?;
        if !visited.insert(canonical.clone()) {
            return Ok(());
        }

        let metadata = fs::metadata(&canonical)?;
        if metadata.is_dir() {
            debug!(dir = ?canonical, "visiting directory");
            for entry in fs::read_dir(&canonical)? {
                let entry = entry?;
                if entry.file_type()?.is_symlink() {
                    continue;
                }
                visit_dir(&entry.path(), out, visited)?;
            }
        } else if metadata.is_file() && is_note(&canonical) {
            out.push(canonical);
        }
        Ok(())
    }

    pub fn is_note(path: &Path) -> bool {
        path.extension()
            .map(|ext| ext == NOTE_EXTENSION)
            .unwrap_or(false)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn lists_markdown_notes_recursively() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let root = tmp.path();
            fs::create_dir_all(root.join("b/deeper")).expect("mkdir");
            fs::write(root.join("a.md"), "a").expect("write");
            fs::write(root.join("b/deeper/c.md"), "c").expect("write");
            fs::write(root.join("b/notes.txt"), "skip").expect("write");

            let store = FsNoteStore::new(root).expect("store");
            assert_eq!(
                store.list().expect("list"),
                vec![PathBuf::from("a.md"), PathBuf::from("b/deeper/c.md")]
            );
        }

        #[test]
        fn write_replaces_note_text() {
            let tmp = tempfile::tempdir().expect("tempdir");
            fs::write(tmp.path().join("n.md"), "old").expect("write");
            let store = FsNoteStore::new(tmp.path()).expect("store");

            store.write(Path::new("n.md"), "new").expect("write");
            assert_eq!(store.read(Path::new("n.md")).expect("read"), "new");
        }

        #[test]
        fn root_must_be_a_directory() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let file = tmp.path().join("n.md");
            fs::write(&file, "x").expect("write");
            assert!(FsNoteStore::new(&file).is_err());
            assert!(FsNoteStore::new(tmp.path().join("missing")).is_err());
        }
    }
}

pub mod projectors {
    pub mod review_queue_projector {
        //! Projects due notes into an ordered review queue.

        use crate::note::due_repetition;
        use crate::review::ReviewItem;
        use crate::settings::Settings;
        use crate::storage::NoteStore;
        use crate::summary::fully_summarize_due_at;
        use anyhow::Result;
        use chrono::{DateTime, FixedOffset};
        use std::path::{Path, PathBuf};
        use tracing::{debug, warn};

        /// Due notes among `notes`: real schedules before virtual ones, then oldest first.
        ///
        /// A note that was never scheduled counts as due at `now`.
        pub fn project_notes<'a>(
            notes: impl IntoIterator<Item = (&'a Path, &'a str)>,
            settings: &Settings,
            now: DateTime<FixedOffset>,
        ) -> Vec<ReviewItem> {
            let ignored = (!settings.ignore_folder_path.is_empty())
                .then(|| PathBuf::from(&settings.ignore_folder_path));

            let mut items: Vec<ReviewItem> = notes
                .into_iter()
                .filter(|(path, _)| ignored.as_ref().is_none_or(|dir| !path.starts_with(dir)))
                .filter_map(|(path, content)| {
                    let repetition = due_repetition(content, settings, now)?;
                    let due_at = repetition.due_at.unwrap_or(now);
                    (due_at <= now).then(|| ReviewItem {
                        path: path.to_path_buf(),
                        summary: fully_summarize_due_at(due_at, now),
                        repetition,
                    })
                })
                .collect();

            items.sort_by_key(|item| (item.repetition.is_virtual, item.repetition.due_at));
            items
        }

        /// Load every note in `store` and project the due ones.
        pub fn project_due_notes(
            store: &impl NoteStore,
            settings: &Settings,
            now: DateTime<FixedOffset>,
        ) -> Result<Vec<ReviewItem>> {
            let mut loaded = Vec::new();
            for path in store.list()? {
                match store.read(&path) {
                    Ok(content) => loaded.push((path, content)),
                    Err(err) => warn!(?path, "skipping unreadable note: {err:#}"),
                }
            }
            debug!(notes = loaded.len(), "projecting review queue");
            Ok(project_notes(
                loaded.iter().map(|(p, c)| (p.as_path(), c.as_str())),
                settings,
                now,
            ))
        }

        pub fn next_due_note(
            store: &impl NoteStore,
            settings: &Settings,
            now: DateTime<FixedOffset>,
        ) -> Result<Option<ReviewItem>> {
            Ok(project_due_notes(store, settings, now)?.into_iter().next())
        }

    }
}

pub use choices::get_choices;
pub use engine::advance;
pub use frontmatter::{apply_field_updates, frontmatter_bounds, strip_frontmatter};
pub use note::{NoteSchedule, apply_choice, due_repetition, read_note, schedule_note};
pub use parser::parse_repeat;
pub use settings::Settings;
