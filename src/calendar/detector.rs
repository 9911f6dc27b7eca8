use std::collections::BTreeMap;

use anyhow::Context;
use chrono::{Datelike, NaiveDate};
use log::debug;
use regex::Regex;

use super::{AvailabilityResult, Mark};

/// Pattern based reader for the reservation calendar page.
///
/// The page renders a week view as a `<table class="...calendar...">`: the
/// header row holds one `M/D` cell per day, and every following row starts
/// with a time label followed by one marker cell per day. Anything outside
/// that table (legends, notices) is ignored.
///
/// Patterns are compiled once in [`Detector::new`]; [`Detector::detect`] is a
/// pure function of its inputs.
#[derive(Debug, Clone)]
pub struct Detector {
    table: Regex,
    body: Regex,
    row: Regex,
    cell: Regex,
    tag: Regex,
    entity: Regex,
    date_token: Regex,
    time_token: Regex,
    wrapped_mark: Regex,
}

impl Detector {
    pub fn new() -> Result<Self, anyhow::Error> {
        Ok(Self {
            table: Regex::new(
                r#"(?is)<table\b[^>]*\bclass\s*=\s*["']([^"']*calendar[^"']*)["'][^>]*>(.*?)</table\s*>"#,
            )
            .context("failed to build the calendar table expression")?,
            body: Regex::new(r"(?is)<tbody\b[^>]*>(.*?)</tbody\s*>")
                .context("failed to build the tbody expression")?,
            row: Regex::new(r"(?is)<tr\b[^>]*>(.*?)</tr\s*>")
                .context("failed to build the row expression")?,
            cell: Regex::new(r"(?is)<t[hd]\b[^>]*>(.*?)</t[hd]\s*>")
                .context("failed to build the cell expression")?,
            tag: Regex::new(r"(?s)<[^>]*>").context("failed to build the tag expression")?,
            entity: Regex::new(r"&#(?:x([0-9a-fA-F]+)|([0-9]+));")
                .context("failed to build the entity expression")?,
            date_token: Regex::new(r"^(\d{1,2}/\d{1,2})(?:\D|$)")
                .context("failed to build the date header expression")?,
            time_token: Regex::new(r"^(\d{1,2}:\d{2})")
                .context("failed to build the time label expression")?,
            wrapped_mark: Regex::new(
                r"(?is)<([a-z][a-z0-9]*)\b[^>]*>\s*([○◯◎△])\s*</([a-z][a-z0-9]*)\s*>",
            )
            .context("failed to build the fallback marker expression")?,
        })
    }

    /// Reads the availability out of `markup`.
    ///
    /// Without a target date only the data region is scanned and no time
    /// slots are extracted. With a target date, a date missing from the
    /// rendered header yields an unavailable result: the date simply was not
    /// observed on this page.
    pub fn detect(&self, markup: &str, target_date: Option<NaiveDate>) -> AvailabilityResult {
        match target_date {
            None => AvailabilityResult {
                has_availability: self.any_mark(markup),
                time_slots: BTreeMap::new(),
            },
            Some(date) => self.detect_date(markup, date),
        }
    }

    fn any_mark(&self, markup: &str) -> bool {
        match self.data_region(markup) {
            Some(region) => has_available_mark(&self.text(region)),
            None => {
                debug!("no calendar table found, falling back to a tight marker scan");
                self.wrapped_mark.captures_iter(markup).any(|caps| {
                    caps[1].eq_ignore_ascii_case(&caps[3])
                })
            }
        }
    }

    fn detect_date(&self, markup: &str, date: NaiveDate) -> AvailabilityResult {
        let scope = self.calendar_table(markup).unwrap_or(markup);
        let rows = self.rows(scope);

        let Some(header_index) = rows
            .iter()
            .position(|cells| cells.iter().any(|c| self.date_token.is_match(c)))
        else {
            debug!("no date header row found");
            return AvailabilityResult::unavailable();
        };

        let wanted = format!("{}/{}", date.month(), date.day());
        let column = rows[header_index]
            .iter()
            .filter_map(|c| self.date_token.captures(c))
            .position(|caps| caps[1] == wanted);

        let Some(column) = column else {
            debug!("{} is not in the rendered window", wanted);
            return AvailabilityResult::unavailable();
        };

        let mut slots: Vec<String> = Vec::new();
        for cells in &rows[header_index + 1..] {
            let Some((label, columns)) = cells.split_first() else {
                continue;
            };
            let Some(time) = self.time_token.captures(label) else {
                continue;
            };
            let open = columns
                .get(column)
                .is_some_and(|cell| has_available_mark(cell));

            if open && !slots.iter().any(|s| s == &time[1]) {
                slots.push(time[1].to_string());
            }
        }

        let mut time_slots = BTreeMap::new();
        let has_availability = !slots.is_empty();
        if has_availability {
            time_slots.insert(date, slots);
        }

        AvailabilityResult {
            has_availability,
            time_slots,
        }
    }

    /// Inner markup of the calendar grid. Several tables may carry a
    /// calendar class (`calendar-legend`, `calendar-nav`, ...): the first one
    /// with a date header row wins, then the first one whose class list has
    /// `calendar` as a whole word.
    fn calendar_table<'a>(&self, markup: &'a str) -> Option<&'a str> {
        let tables: Vec<(&str, &str)> = self
            .table
            .captures_iter(markup)
            .filter_map(|caps| Some((caps.get(1)?.as_str(), caps.get(2)?.as_str())))
            .collect();

        tables
            .iter()
            .find(|(_, content)| self.has_date_header(content))
            .or_else(|| {
                tables.iter().find(|(class, _)| {
                    class
                        .split_whitespace()
                        .any(|c| c.eq_ignore_ascii_case("calendar"))
                })
            })
            .map(|(_, content)| *content)
    }

    fn has_date_header(&self, table: &str) -> bool {
        self.rows(table)
            .iter()
            .flatten()
            .any(|cell| self.date_token.is_match(cell))
    }

    /// Plain text of every cell, row by row.
    fn rows(&self, scope: &str) -> Vec<Vec<String>> {
        self.row
            .captures_iter(scope)
            .map(|row| {
                self.cell
                    .captures_iter(&row[1])
                    .map(|cell| self.text(&cell[1]))
                    .collect()
            })
            .collect()
    }

    /// The part of the page holding the per slot cells: the calendar table's
    /// body, or the whole table when it has no `<tbody>`.
    fn data_region<'a>(&self, markup: &'a str) -> Option<&'a str> {
        let table = self.calendar_table(markup)?;
        Some(
            self.body
                .captures(table)
                .and_then(|caps| caps.get(1))
                .map_or(table, |m| m.as_str()),
        )
    }

    /// Cell markup to plain text.
    fn text(&self, fragment: &str) -> String {
        let stripped = self.tag.replace_all(fragment, " ");
        let decoded = self.entity.replace_all(&stripped, |caps: &regex::Captures| {
            let code = match (caps.get(1), caps.get(2)) {
                (Some(hex), _) => u32::from_str_radix(hex.as_str(), 16).ok(),
                (_, Some(dec)) => dec.as_str().parse().ok(),
                _ => None,
            };
            code.and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_default()
        });

        decoded
            .replace("&nbsp;", " ")
            .replace("&times;", "×")
            .replace("&amp;", "&")
            .trim()
            .to_string()
    }
}

fn has_available_mark(text: &str) -> bool {
    text.chars()
        .filter_map(Mark::from_char)
        .any(Mark::is_available)
}
