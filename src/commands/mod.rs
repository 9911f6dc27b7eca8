use chrono::{DateTime, Datelike, NaiveDate, Utc};
use chrono_tz::Tz;
use log::info;

use crate::store::{
    self, DocumentStore, Recipient, WatchConfig, WatchState, MAX_INTERVAL_MINUTES,
    MIN_INTERVAL_MINUTES,
};

pub const HELP: &str = "Commands:
  register [id]   receive the notifications (defaults to you)
  start | stop    turn watching on or off
  add DATE...     watch dates (2025-01-03, 2025/1/3 or 1/3)
  remove DATE...  stop watching dates
  clear           watch every date on the calendar
  interval N      check every N minutes (1-60)
  status          show the current settings
  help            show this message";

/// A text command sent to the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Register(Option<String>),
    Enable,
    Disable,
    Add(Vec<String>),
    Remove(Vec<String>),
    Clear,
    Interval(Option<String>),
    Status,
    Help,
}

impl Command {
    /// Reads a command out of free text. The first word picks the command,
    /// the rest are its arguments. Unknown text gives `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let mut words = text.split_whitespace();
        let keyword = words.next()?.to_lowercase();
        let args: Vec<String> = words.map(|w| w.to_string()).collect();

        let command = match keyword.as_str() {
            "register" => Self::Register(args.into_iter().next()),
            "start" | "on" | "enable" => Self::Enable,
            "stop" | "off" | "disable" => Self::Disable,
            "add" => Self::Add(args),
            "remove" | "rm" => Self::Remove(args),
            "clear" => Self::Clear,
            "interval" => Self::Interval(args.into_iter().next()),
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            _ => return None,
        };

        Some(command)
    }
}

/// Parses `YYYY-MM-DD`, `YYYY/M/D` or `M/D`. The short form means the next
/// such day on or after `today`.
pub fn parse_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    for format in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date);
        }
    }

    let (month, day) = text.split_once('/')?;
    let month: u32 = month.parse().ok()?;
    let day: u32 = day.parse().ok()?;

    match NaiveDate::from_ymd_opt(today.year(), month, day) {
        Some(date) if date >= today => Some(date),
        _ => NaiveDate::from_ymd_opt(today.year() + 1, month, day),
    }
}

fn parse_dates(args: &[String], today: NaiveDate) -> Result<Vec<NaiveDate>, String> {
    if args.is_empty() {
        return Err("Please give at least one date, e.g. `add 1/3`.".to_string());
    }

    args.iter()
        .map(|arg| parse_date(arg, today).ok_or_else(|| format!("`{}` is not a date.", arg)))
        .collect()
}

fn list_dates<'a>(dates: impl IntoIterator<Item = &'a NaiveDate>) -> String {
    let dates: Vec<String> = dates.into_iter().map(|d| d.to_string()).collect();
    if dates.is_empty() {
        "all dates".to_string()
    } else {
        dates.join(", ")
    }
}

/// Applies `command` and returns the reply for the sender.
///
/// Every change is written to the store before returning, so the next watch
/// cycle picks it up.
pub async fn dispatch(
    store: &dyn DocumentStore,
    sender: &str,
    command: Command,
    now: DateTime<Utc>,
    timezone: Tz,
) -> Result<String, anyhow::Error> {
    let today = now.with_timezone(&timezone).date_naive();

    let reply = match command {
        Command::Register(id) => {
            let recipient = Recipient {
                id: id.unwrap_or_else(|| sender.to_string()),
                updated_at: now,
            };
            store::save(store, &recipient).await?;

            if store::load::<WatchConfig>(store).await?.is_none() {
                let config = WatchConfig {
                    enabled: true,
                    ..WatchConfig::default()
                };
                store::save(store, &config).await?;
            }

            info!("registered {} as the recipient", recipient.id);
            format!("Notifications will be sent to {}.", recipient.id)
        }
        Command::Enable => {
            let mut config = load_config(store).await?;
            config.enabled = true;
            store::save(store, &config).await?;
            format!(
                "Watching {} every {} min.",
                list_dates(&config.target_dates),
                config.interval()
            )
        }
        Command::Disable => {
            let mut config = load_config(store).await?;
            config.enabled = false;
            store::save(store, &config).await?;
            "Watching stopped.".to_string()
        }
        Command::Add(args) => match parse_dates(&args, today) {
            Err(reply) => reply,
            Ok(dates) => {
                if let Some(past) = dates.iter().find(|d| **d < today) {
                    format!("{} is in the past.", past)
                } else {
                    let mut config = load_config(store).await?;
                    config.target_dates.extend(dates);
                    store::save(store, &config).await?;
                    format!("Watching {}.", list_dates(&config.target_dates))
                }
            }
        },
        Command::Remove(args) => match parse_dates(&args, today) {
            Err(reply) => reply,
            Ok(dates) => {
                let mut config = load_config(store).await?;
                let missing: Vec<NaiveDate> = dates
                    .into_iter()
                    .filter(|d| !config.target_dates.remove(d))
                    .collect();
                store::save(store, &config).await?;

                let mut reply = format!("Watching {}.", list_dates(&config.target_dates));
                if !missing.is_empty() {
                    reply = format!("{} were not watched. {}", list_dates(&missing), reply);
                }
                reply
            }
        },
        Command::Clear => {
            let mut config = load_config(store).await?;
            config.target_dates.clear();
            store::save(store, &config).await?;
            "Watching all dates.".to_string()
        }
        Command::Interval(arg) => match arg.as_deref().map(str::parse::<i64>) {
            Some(Ok(minutes)) if (MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&minutes) => {
                let mut config = load_config(store).await?;
                config.interval_minutes = minutes;
                store::save(store, &config).await?;
                format!("Checking every {} min.", minutes)
            }
            _ => format!(
                "The interval must be a number of minutes between {} and {}.",
                MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES
            ),
        },
        Command::Status => status(store, timezone).await?,
        Command::Help => HELP.to_string(),
    };

    Ok(reply)
}

async fn load_config(store: &dyn DocumentStore) -> Result<WatchConfig, anyhow::Error> {
    Ok(store::load::<WatchConfig>(store).await?.unwrap_or_default())
}

async fn status(store: &dyn DocumentStore, timezone: Tz) -> Result<String, anyhow::Error> {
    let config = load_config(store).await?;
    let recipient = store::load::<Recipient>(store).await?;
    let state = store::load::<WatchState>(store).await?;

    let format_time =
        |time: DateTime<Utc>| time.with_timezone(&timezone).format("%Y-%m-%d %H:%M %Z").to_string();

    let mut lines = vec![
        format!("Watching: {}", if config.enabled { "on" } else { "off" }),
        format!("Interval: {} min", config.interval()),
        format!("Dates: {}", list_dates(&config.target_dates)),
        format!(
            "Recipient: {}",
            recipient.map_or_else(|| "none".to_string(), |r| r.id)
        ),
    ];

    match state {
        Some(state) => {
            lines.push(format!(
                "Last check: {} ({})",
                format_time(state.checked_at),
                if state.has_availability {
                    "available"
                } else {
                    "nothing open"
                }
            ));
            lines.push(format!(
                "Last notification: {}",
                state
                    .last_notified_at
                    .map_or_else(|| "never".to_string(), format_time)
            ));
        }
        None => lines.push("Last check: never".to_string()),
    }

    Ok(lines.join("\n"))
}
