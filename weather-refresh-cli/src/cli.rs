use anyhow::{Context, Result, bail};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use inquire::{Confirm, CustomType, Password, PasswordDisplayMode};
use weather_refresh_core::{Config, Outcome, ProviderId, ScheduleController, WeatherRecord};

use crate::app::App;

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather-refresh", version, about = "Keeps a local weather record fresh")]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure credentials (and the device location) for a provider.
    Configure {
        /// Provider short name, e.g. "openweather" or "pirateweather".
        provider: String,
    },

    /// Schedule periodic refreshes for a provider.
    Schedule {
        /// Defaults to the configured default provider.
        provider: Option<String>,

        /// Refresh interval in seconds; provider default otherwise.
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Stop periodic refreshes for a provider.
    Cancel { provider: Option<String> },

    /// Refresh now, ignoring how fresh the stored record is.
    Run { provider: Option<String> },

    /// Show schedule state for one or all providers.
    Status { provider: Option<String> },

    /// Show the stored weather record.
    Show { provider: Option<String> },

    /// Keep every scheduled provider refreshing until interrupted.
    Daemon,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Configure { provider } => configure(&provider),
            Command::Schedule { provider, interval } => {
                let (app, id) = load(provider.as_deref())?;
                let interval = interval.unwrap_or_else(|| app.config().refresh_interval_secs(id));
                let api_key = app.config().require_api_key(id)?;

                let meta = app.controller(id)?.schedule(interval, api_key)?;
                println!(
                    "Scheduled {id} every {}s. Run `weather-refresh daemon` to keep it refreshing.",
                    meta.interval_secs(id.default_interval_secs())
                );
                Ok(())
            }
            Command::Cancel { provider } => {
                let (app, id) = load(provider.as_deref())?;
                app.controller(id)?.cancel()?;
                println!("Cancelled scheduled refreshes for {id}.");
                Ok(())
            }
            Command::Run { provider } => {
                let (app, id) = load(provider.as_deref())?;
                app.config().require_api_key(id)?;
                let controller = app.controller(id)?;

                let outcome = controller.run_now().await;
                println!("Refresh for {id}: {outcome}");
                match outcome {
                    Outcome::Success => print_record(&controller.weather()?),
                    Outcome::Reschedule => {
                        println!("The stored record was left unchanged; see the log for why.")
                    }
                    Outcome::Failure => bail!("Refresh for {id} failed"),
                }
                Ok(())
            }
            Command::Status { provider } => {
                let config = Config::load()?;
                let ids = match provider.as_deref() {
                    Some(name) => vec![ProviderId::try_from(name)?],
                    None => ProviderId::all().to_vec(),
                };
                let app = App::new(config)?;
                for id in ids {
                    print_status(app.config(), id, &app.controller(id)?)?;
                }
                Ok(())
            }
            Command::Show { provider } => {
                let (app, id) = load(provider.as_deref())?;
                let controller = app.controller(id)?;
                print_record(&controller.weather()?);
                println!("Day phase:   {:?}", controller.day_phase()?);
                Ok(())
            }
            Command::Daemon => daemon().await,
        }
    }
}

fn load(provider: Option<&str>) -> Result<(App, ProviderId)> {
    let config = Config::load()?;
    let id = config.resolve_provider(provider)?;
    Ok((App::new(config)?, id))
}

fn configure(provider: &str) -> Result<()> {
    let id = ProviderId::try_from(provider)?;
    let mut config = Config::load()?;

    if id.requires_api_key() {
        let api_key = Password::new(&format!("API key for {id}:"))
            .with_display_mode(PasswordDisplayMode::Masked)
            .without_confirmation()
            .prompt()
            .context("Failed to read API key")?;
        if api_key.trim().is_empty() {
            bail!("API key must not be empty");
        }
        config.upsert_provider_api_key(id, api_key.trim().to_string());
    } else {
        println!("{id} needs no API key.");
        config.providers.entry(id.as_str().to_string()).or_default();
        if config.default_provider.is_none() {
            config.set_default_provider(id);
        }
    }

    if config.location.coordinates().is_none() {
        let latitude = CustomType::<f64>::new("Latitude:")
            .with_error_message("Please type a number, e.g. 45.42")
            .prompt()
            .context("Failed to read latitude")?;
        let longitude = CustomType::<f64>::new("Longitude:")
            .with_error_message("Please type a number, e.g. -75.69")
            .prompt()
            .context("Failed to read longitude")?;
        config.location.latitude = Some(latitude);
        config.location.longitude = Some(longitude);
    }

    if config.default_provider.as_deref() != Some(id.as_str()) {
        let make_default = Confirm::new(&format!("Make {id} the default provider?"))
            .with_default(false)
            .prompt()
            .context("Failed to read answer")?;
        if make_default {
            config.set_default_provider(id);
        }
    }

    config.save()?;
    println!(
        "Saved configuration to {}",
        Config::config_file_path()?.display()
    );
    Ok(())
}

async fn daemon() -> Result<()> {
    let app = App::new(Config::load()?)?;

    let mut controllers = Vec::new();
    for id in ProviderId::all().iter().copied() {
        let controller = app.controller(id)?;
        if controller.reinitialize()? {
            tracing::info!(provider = %id, "resumed schedule");
            controllers.push(controller);
        }
    }
    if controllers.is_empty() {
        bail!(
            "Nothing is scheduled.\n\
             Hint: run `weather-refresh schedule <provider>` first."
        );
    }

    let mut changes = app.notifier().subscribe();
    loop {
        tokio::select! {
            event = changes.recv() => {
                let Some(event) = event else { break };
                if let Some(controller) = controllers.iter().find(|c| c.provider() == event.provider) {
                    let record = controller.weather()?;
                    tracing::info!(
                        provider = %event.provider,
                        condition = %record.condition(),
                        celsius = record.celsius(),
                        "weather updated"
                    );
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                tracing::info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}

fn print_status(config: &Config, id: ProviderId, controller: &ScheduleController) -> Result<()> {
    let meta = controller.metadata()?;
    let record = controller.weather()?;
    let state = match (meta.scheduled, controller.is_scheduled()?) {
        (false, _) => "not scheduled",
        (true, true) => "scheduled",
        (true, false) => "lapsed (run `weather-refresh schedule` again)",
    };

    println!("{id}");
    println!("  state:        {state}");
    println!("  credentials:  {}", credentials_state(config, id));
    println!(
        "  interval:     {}s",
        meta.interval_secs(id.default_interval_secs())
    );
    println!("  last update:  {}", describe_update(&record));
    Ok(())
}

fn credentials_state(config: &Config, id: ProviderId) -> String {
    if !id.requires_api_key() {
        "not needed".to_string()
    } else if config.is_provider_configured(id) {
        "configured".to_string()
    } else {
        format!("missing (run `weather-refresh configure {id}`)")
    }
}

fn print_record(record: &WeatherRecord) {
    println!(
        "Temperature: {:.1}°C ({}°F)",
        record.celsius(),
        record.fahrenheit()
    );
    println!("Condition:   {}", record.condition());
    println!(
        "Wind:        {} km/h ({} mph)",
        record.wind_kph(),
        record.wind_mph()
    );
    println!("Sunrise:     {}", record.sunrise());
    println!("Sunset:      {}", record.sunset());
    println!("Moon:        {}", record.moon_phase());
    println!("Updated:     {}", describe_update(record));
}

fn describe_update(record: &WeatherRecord) -> String {
    if record.last_update() == WeatherRecord::default().last_update() {
        return "never".to_string();
    }
    let age = record.age(Utc::now());
    format!(
        "{} ({} min ago)",
        record.last_update().with_timezone(&Local).format("%Y-%m-%d %H:%M"),
        age.num_minutes()
    )
}
