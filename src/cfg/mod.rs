use serde::Deserialize;

fn default_date_param() -> String {
    "date".to_string()
}

fn default_user_agent() -> String {
    concat!("vacancy-watch/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_timeout() -> String {
    "15s".to_string()
}

fn default_trigger() -> String {
    "* * * * *".to_string()
}

fn default_timezone() -> String {
    "Asia/Tokyo".to_string()
}

#[derive(Deserialize, Debug, Clone)]
/// The reservation calendar being watched.
/// Check each field for the documentation and usages.
pub struct TargetConfig {
    /// Url of the calendar page.
    /// this can use the http or https protocol.
    pub url: String,
    /// Name of the query parameter used to ask the page for the week
    /// containing a given date. The value is sent as `YYYY-MM-DD`.
    #[serde(default = "default_date_param")]
    pub date_param: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Per request timeout, in the humantime syntax (`15s`, `1m`).
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
/// Messaging API used to push notifications and answer commands.
pub struct MessagingConfig {
    /// Base url of the messaging API; `/push` is appended.
    pub endpoint: String,
    /// Bearer token of the channel.
    pub token: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
/// Specifies where the documents (recipient, watch config and state) live.
pub struct StorageConfig {
    /// Relative or absolute path to the store directory.
    /// `~` and environment variables are expanded.
    pub path: String,
}

#[derive(Deserialize, Debug, Clone)]
/// Timing of the watch loop.
pub struct ScheduleConfig {
    /// How often the loop wakes up, using the cron syntax.
    /// The effective poll cadence is the interval stored with the watch
    /// settings; this only needs to fire at least as often.
    #[serde(default = "default_trigger")]
    pub trigger: String,
    /// Time zone used when displaying timestamps.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            trigger: default_trigger(),
            timezone: default_timezone(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
/// Main configuration structure
/// This does not have any particular meaning; It just contains
/// all the configuration blocks.
pub struct Config {
    pub target: TargetConfig,
    pub messaging: MessagingConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[cfg(test)]
mod test {
    use config::{Config as Loader, File, FileFormat};

    use super::Config;

    #[test]
    fn defaults_are_applied() {
        let source = r#"
            [target]
            url = "https://example.com/reserve"

            [messaging]
            endpoint = "https://api.example.com/v2/bot/message"
            token = "secret"

            [storage]
            path = "~/.vacancy-watch"
        "#;

        let config: Config = Loader::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.target.date_param, "date");
        assert_eq!(config.target.timeout, "15s");
        assert_eq!(config.schedule.trigger, "* * * * *");
        assert_eq!(config.schedule.timezone, "Asia/Tokyo");
    }
}
