use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, error, info, warn};

use crate::{
    bot::Messenger,
    store::{self, DocumentStore, Recipient, WatchConfig, WatchState},
};

use super::{AvailabilityResult, Fetch};

/// Grace band, in minutes, subtracted from the configured interval so a
/// trigger firing a little early still polls.
pub const INTERVAL_GRACE_MINUTES: f64 = 0.5;

/// How a cycle ended. Only used for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Watching is off (or was never configured).
    Disabled,
    /// The configured interval has not elapsed since the last check.
    NotDue,
    /// Nobody to notify.
    NoRecipient,
    /// The unfiltered check failed; the previous state was kept.
    Aborted,
    Checked {
        has_availability: bool,
        notified: bool,
    },
}

/// Polls the calendar and notifies on the rising edge of availability.
///
/// The watcher keeps no state of its own: configuration and the previous
/// verdict are read from the store on every cycle, so it can be invoked as
/// often as the trigger likes.
pub struct Watcher {
    store: Arc<dyn DocumentStore>,
    fetcher: Arc<dyn Fetch>,
    messenger: Arc<dyn Messenger>,
    url: String,
}

impl Watcher {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        fetcher: Arc<dyn Fetch>,
        messenger: Arc<dyn Messenger>,
        url: String,
    ) -> Self {
        Self {
            store,
            fetcher,
            messenger,
            url,
        }
    }

    /// Runs one polling cycle as of `now`.
    ///
    /// Fetch failures are handled here; only store faults are returned.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleOutcome, anyhow::Error> {
        let store = &*self.store;

        let config = match store::load::<WatchConfig>(store).await? {
            Some(config) if config.enabled => config,
            _ => {
                debug!("watching is disabled");
                return Ok(CycleOutcome::Disabled);
            }
        };

        let previous = store::load::<WatchState>(store).await?;
        if let Some(state) = &previous {
            let elapsed = (now - state.checked_at).num_milliseconds() as f64 / 60_000f64;
            let due = config.interval() as f64 - INTERVAL_GRACE_MINUTES;
            if elapsed < due {
                debug!(
                    "last check {:.1} min ago, next one after {:.1} min",
                    elapsed, due
                );
                return Ok(CycleOutcome::NotDue);
            }
        }

        let Some(recipient) = store::load::<Recipient>(store).await? else {
            warn!("no recipient registered, skipping the check");
            return Ok(CycleOutcome::NoRecipient);
        };

        let Some(current) = self.evaluate(&config.target_dates).await else {
            return Ok(CycleOutcome::Aborted);
        };

        let mut was_available = previous.as_ref().is_some_and(|s| s.has_availability);
        if let Some(state) = &previous {
            if state.checked_target_dates != config.target_dates {
                info!(
                    "target dates changed from [{}] to [{}], starting from a fresh baseline",
                    join_dates(&state.checked_target_dates),
                    join_dates(&config.target_dates)
                );
                was_available = false;
            }
        }

        let notify = !was_available && current.has_availability;
        if notify {
            let message = compose_message(&current, &self.url);
            match self.messenger.push(&recipient.id, &message).await {
                Ok(()) => info!("notified {} of new availability", recipient.id),
                // not retried: the next cycle sees a steady state and stays quiet
                Err(err) => error!("failed to deliver the availability notification: {}", err),
            }
        } else if current.has_availability {
            debug!("still available, already notified");
        } else if was_available {
            info!("availability is gone");
        }

        let state = WatchState {
            has_availability: current.has_availability,
            checked_at: now,
            last_notified_at: if notify {
                Some(now)
            } else {
                previous.and_then(|s| s.last_notified_at)
            },
            checked_target_dates: config.target_dates,
        };
        store::save(store, &state).await?;

        Ok(CycleOutcome::Checked {
            has_availability: current.has_availability,
            notified: notify,
        })
    }

    /// Checks every target date, or the whole calendar when there is none.
    ///
    /// A failing date is skipped. A failing unfiltered check returns `None`
    /// so the previous state is not overwritten by a false negative.
    async fn evaluate(&self, dates: &BTreeSet<NaiveDate>) -> Option<AvailabilityResult> {
        if dates.is_empty() {
            return match self.fetcher.check_availability(None).await {
                Ok(result) => Some(result),
                Err(err) => {
                    error!("failed to check the calendar, keeping the previous state: {}", err);
                    None
                }
            };
        }

        let tasks = dates.iter().map(|date| async move {
            (*date, self.fetcher.check_availability(Some(*date)).await)
        });
        let results = futures::future::join_all(tasks).await;

        let mut merged = AvailabilityResult::unavailable();
        let mut failed = 0;
        for (date, result) in results {
            match result {
                Ok(mut result) if result.has_availability => {
                    debug!("{} is available", date);
                    merged.has_availability = true;
                    let slots = result.time_slots.remove(&date).unwrap_or_default();
                    merged.time_slots.insert(date, slots);
                }
                Ok(_) => debug!("{} is not available", date),
                Err(err) => {
                    error!("failed to check {}: {}", date, err);
                    failed += 1;
                }
            }
        }

        if failed == dates.len() {
            warn!(
                "every target date failed to load, recording no availability; \
                 a date that was already notified will be notified again once it loads"
            );
        }

        Some(merged)
    }
}

fn join_dates(dates: &BTreeSet<NaiveDate>) -> String {
    dates
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Notification text: one line per available date with its time slots, or a
/// generic line when the check was not filtered by date.
pub fn compose_message(result: &AvailabilityResult, url: &str) -> String {
    let mut message = String::new();

    if result.time_slots.is_empty() {
        message.push_str("Reservation slots have opened up on the calendar!\n");
    } else {
        message.push_str("Reservation slots have opened up!\n");
        for (date, slots) in &result.time_slots {
            message += &date.format("%Y-%m-%d (%a)").to_string();
            if !slots.is_empty() {
                message += &format!(": {}", slots.join(", "));
            }
            message.push('\n');
        }
    }

    message.push_str(url);
    message
}
