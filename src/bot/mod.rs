use crate::calendar::{CycleOutcome, Detector, Fetcher, Watcher};
use crate::commands::{self, Command};
use crate::store::{DocumentStore, FileStore};
use crate::cfg::Config;
use anyhow::{bail, Context};
use chrono::Utc;
use chrono_tz::Tz;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::{debug, error, info};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::Receiver;
use tokio::time::sleep;
use tokio::{signal, sync::broadcast::Sender};

pub mod messenger;

pub use messenger::{HttpMessenger, Messenger};

#[cfg(test)]
pub use messenger::FakeMessenger;

/// Sender id used for commands typed on the console.
const CONSOLE_SENDER: &str = "console";

// Shared by all the tasks
pub struct Data {
    pub config: Arc<Config>,
    pub store: Arc<dyn DocumentStore>,
    pub watcher: Watcher,
    pub timezone: Tz,
}

pub struct Bot {
    pub data: Arc<Data>,
    pub shutdown: Receiver<()>,
    shutdown_send: Sender<()>,
}

/// Sends a message through `shutdown_send` when a stop signal is detected.
/// Used to start the bot stop sequence.
async fn wait_for_stop_signal(bot: Arc<Bot>) -> Result<(), anyhow::Error> {
    let mut shutdown = bot.shutdown.resubscribe();
    tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => {
                    info!("stop signal received");
                    bot.shutdown_send
                        .send(())
                        .context("failed to send a shutdown signal")?;
                    Ok(())
                }
                Err(err) => Err(anyhow::anyhow!(err)),
            }
        },
        _ = shutdown.recv() => { Ok(()) }
    }
}

/// Runs a watch cycle at startup, then on every tick of the cron trigger.
/// A failing cycle is logged and left to the next tick.
async fn watch_task(bot: Arc<Bot>) -> Result<(), anyhow::Error> {
    let mut shutdown = bot.shutdown.resubscribe();
    let schedule = saffron::Cron::new(match bot.data.config.schedule.trigger.parse() {
        Ok(r) => r,
        Err(e) => bail!("failed to parse the cron expression: {}", e),
    });

    bot.run_cycle().await;

    loop {
        // calculate the next cron execution and wait
        let current_time = Utc::now();
        let next = schedule
            .next_after(current_time)
            .context("failed to get next date")?;

        let sleep_time = next - current_time;
        debug!("waiting {}s, trigger at {}", sleep_time.num_seconds(), next);

        let wait = sleep(
            sleep_time
                .to_std()
                .context("failed to convert a chrono duration to a std duration")?,
        );

        tokio::select! {
            _ = wait => bot.run_cycle().await,
            _ = shutdown.recv() => {
                return Ok(());
            }
        }
    }
}

/// Reads commands from stdin, one per line, and prints the replies.
async fn console_task(bot: Arc<Bot>) -> Result<(), anyhow::Error> {
    let mut shutdown = bot.shutdown.resubscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read from stdin")? else {
                    // no console attached; keep running until told to stop
                    debug!("stdin closed");
                    let _ = shutdown.recv().await;
                    return Ok(());
                };
                if line.trim().is_empty() {
                    continue;
                }
                println!("{}", bot.handle_text(CONSOLE_SENDER, &line).await);
            },
            _ = shutdown.recv() => {
                return Ok(());
            }
        }
    }
}

impl Bot {
    pub fn new(config: Arc<Config>) -> Result<Arc<Self>, anyhow::Error> {
        // Theses signals are used to stop the many tasks trigered.
        // this is called by the task listening for a stop signal.
        let (shutdown_send, shutdown) = tokio::sync::broadcast::channel(1);

        let timezone: Tz = match config.schedule.timezone.parse() {
            Ok(tz) => tz,
            Err(e) => bail!("unknown time zone {}: {}", config.schedule.timezone, e),
        };

        let store: Arc<dyn DocumentStore> = Arc::new(FileStore::new(&config.storage));
        let fetcher = Fetcher::new(&config.target, Detector::new()?)?;
        let messenger = HttpMessenger::new(&config.messaging)?;
        let watcher = Watcher::new(
            store.clone(),
            Arc::new(fetcher),
            Arc::new(messenger),
            config.target.url.clone(),
        );

        let data = Arc::new(Data {
            config,
            store,
            watcher,
            timezone,
        });

        Ok(Arc::new(Self {
            data,
            shutdown,
            shutdown_send,
        }))
    }

    async fn run_cycle(&self) {
        match self.data.watcher.run_cycle(Utc::now()).await {
            Ok(CycleOutcome::Checked {
                has_availability,
                notified,
            }) => info!(
                "checked the calendar: available={} notified={}",
                has_availability, notified
            ),
            Ok(outcome) => debug!("cycle skipped: {:?}", outcome),
            Err(err) => error!("watch cycle failed: {:#}", err),
        }
    }

    /// Turns an inbound text into a reply. Unknown commands get the help.
    pub async fn handle_text(&self, sender: &str, text: &str) -> String {
        let Some(command) = Command::parse(text) else {
            return commands::HELP.to_string();
        };

        debug!("{} sent {:?}", sender, command);
        match commands::dispatch(
            &*self.data.store,
            sender,
            command,
            Utc::now(),
            self.data.timezone,
        )
        .await
        {
            Ok(reply) => reply,
            Err(err) => {
                error!("command from {} failed: {:#}", sender, err);
                "Something went wrong, please try again.".to_string()
            }
        }
    }

    pub async fn start(self: Arc<Self>) -> Result<(), anyhow::Error> {
        let mut tasks = FuturesUnordered::new();

        let self_clone = self.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = watch_task(self_clone).await {
                error!("watch loop stopped: {:#}", err);
            }
        }));
        let self_clone = self.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = console_task(self_clone).await {
                error!("console stopped: {:#}", err);
            }
        }));
        let self_clone = self.clone();
        tasks.push(tokio::spawn(async move {
            let _ = wait_for_stop_signal(self_clone).await;
        }));

        // wait for a task to finish.
        let task = tasks
            .next()
            .await
            .context("no tasks started, illegal state")?
            .context("failed to join task");

        // when a task is finished, we must terminate all the others,
        // hence we send a signal telling all tasks to stop processing
        // and return.
        let _ = self.shutdown_send.send(());

        while let Some(operation) = tasks.next().await {
            operation.context("failed to join task")?;
        }

        task?;
        Ok(())
    }
}
