use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use algoblink_subscriber::client::wait_for_confirmation;
use algoblink_subscriber::notifier::ChannelConsumer;
use algoblink_subscriber::publisher::PublishError;
use algoblink_subscriber::recent::RecentTransactions;
use algoblink_subscriber::selector::selector_for_signature;
use algoblink_subscriber::state::LabelDecoder;
use algoblink_subscriber::subscription::SubmittedCall;
use algoblink_subscriber::{
    AlgodClient, FallbackIndexClient, IndexClient, InMemoryWatermarkStore, LedCommand, LedMethod, LedgerClient,
    Publisher, RedisWatermarkStore, StateReader, Subscriber, SubscriberConfig, WatermarkStore,
};

#[derive(Parser, Debug)]
#[command(name = "algoblink")]
#[command(about = "Watch and control the AlgoBlink LED application on Algorand")]
struct Cli {
    /// Path to subscriber configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log filter, overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to LED control calls and print each one once
    Watch {
        /// Application id, defaults to the configured one
        #[arg(long)]
        app_id: Option<u64>,

        /// Signed transaction file to submit once the subscription is up
        #[arg(long, requires_all = ["command", "sender"])]
        submit: Option<PathBuf>,

        /// Base64 command payload describing the submitted call
        #[arg(long)]
        command: Option<String>,

        /// Address that signed the submitted transaction
        #[arg(long)]
        sender: Option<String>,
    },

    /// Decode a base64 command payload
    Decode { payload: String },

    /// Encode a command payload for a sign link
    Encode {
        #[arg(long)]
        app_id: Option<u64>,

        /// turnOn or turnOff
        #[arg(long)]
        command: String,
    },

    /// Read the current LED state
    State {
        #[arg(long)]
        app_id: Option<u64>,
    },

    /// Submit a signed transaction file and wait for confirmation
    Submit {
        file: PathBuf,

        /// Give up after this many rounds
        #[arg(long, default_value = "10")]
        wait_rounds: u64,
    },

    /// Print the ARC-4 selector of a method signature
    Selector { signature: String },
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn ledger_client(config: &SubscriberConfig) -> Result<Arc<dyn LedgerClient>> {
    let client = AlgodClient::new(config.algod.url.clone(), config.algod.token.clone(), config.request_timeout())?;
    Ok(Arc::new(client))
}

fn index_clients(config: &SubscriberConfig) -> Result<FallbackIndexClient> {
    Ok(FallbackIndexClient::from_urls(
        &config.indexer.urls,
        config.indexer.token.clone(),
        config.request_timeout(),
    )?)
}

fn state_reader(config: &SubscriberConfig, indexers: &FallbackIndexClient) -> StateReader {
    StateReader::new(
        indexers.endpoints().to_vec(),
        Arc::new(LabelDecoder::for_key(&config.state_key)),
    )
}

async fn print_state(reader: &StateReader, app_id: u64) {
    match reader.read_current_state(app_id).await {
        Ok(state) => println!("LED state: {state}"),
        Err(e) => warn!(app_id, error = %e, "Could not read LED state"),
    }
}

/// Describe the call in a `--submit` file so it can be delivered before confirmation
fn submitted_call(sender: Option<String>, command: Option<&str>) -> Result<SubmittedCall> {
    let Some(sender) = sender.filter(|s| !s.trim().is_empty()) else {
        bail!("--sender is required with --submit");
    };
    let first_arg = match command {
        Some(payload) => Some(LedCommand::decode(payload)?.method_arg()),
        None => None,
    };
    Ok(SubmittedCall {
        sender: sender.trim().to_string(),
        first_arg,
    })
}

async fn watch(config: SubscriberConfig, app_id: u64, submission: Option<(PathBuf, SubmittedCall)>) -> Result<()> {
    let ledger = ledger_client(&config)?;
    let indexers = index_clients(&config)?;
    let reader = state_reader(&config, &indexers);

    let (watermarks, mut publisher): (Arc<dyn WatermarkStore>, Option<Publisher>) = match &config.redis.url {
        Some(url) => {
            let client = redis::Client::open(url.as_str()).context("Invalid Redis URL")?;
            let connection = client
                .get_multiplexed_async_connection()
                .await
                .context("Failed to connect to Redis")?;
            info!(url = %url, channel = %config.redis.channel, "Using Redis for watermarks and broadcasts");
            (
                Arc::new(RedisWatermarkStore::new(connection.clone())) as Arc<dyn WatermarkStore>,
                Some(Publisher::new(connection, config.redis.channel.clone())),
            )
        }
        None => (Arc::new(InMemoryWatermarkStore::new()) as Arc<dyn WatermarkStore>, None),
    };

    let subscriber = Subscriber::new(
        Arc::clone(&ledger),
        Arc::new(indexers.clone()) as Arc<dyn IndexClient>,
        watermarks,
        config.resolver()?,
        config.subscription_options(),
    );

    print_state(&reader, app_id).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = subscriber.subscribe(app_id, Arc::new(ChannelConsumer::new(tx))).await?;
    info!(app_id, "Watching for LED control calls, press Ctrl-C to stop");

    if let Some((path, call)) = submission {
        let signed = std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let receipt = handle.submit(&signed, call).await?;
        println!("Submitted {}", receipt.txid);
    }

    let mut recent = RecentTransactions::default();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = rx.recv() => {
                let Some(record) = received else { break };
                println!("{}", record.to_json()?);

                if let Some(publisher) = publisher.as_mut() {
                    match publisher.publish(&record).await {
                        Ok(_) => {}
                        Err(PublishError::NotStateChange(_)) => {}
                        Err(e) => error!(txid = %record.id, error = %e, "Broadcast failed"),
                    }
                }

                recent.push(record);
                for entry in recent.records() {
                    let round = entry.confirmed_round.map_or_else(|| "pending".to_string(), |r| r.to_string());
                    println!("  {:<8} {:<8} {}", round, entry.method_name, entry.id);
                }
                print_state(&reader, app_id).await;
            }
        }
    }

    handle.unsubscribe().await;
    info!(app_id, "Stopped");
    Ok(())
}

async fn submit(config: SubscriberConfig, file: PathBuf, wait_rounds: u64) -> Result<()> {
    let ledger = ledger_client(&config)?;
    let signed = std::fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;
    let txid = ledger.submit(&signed).await?;
    println!("Submitted {txid}");

    let round = wait_for_confirmation(ledger.as_ref(), &txid, wait_rounds, Duration::from_secs(1)).await?;
    println!("Confirmed in round {round}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let config = SubscriberConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Watch {
            app_id,
            submit,
            command,
            sender,
        } => {
            let app_id = app_id.unwrap_or(config.application_id);
            let submission = match submit {
                Some(path) => Some((path, submitted_call(sender, command.as_deref())?)),
                None => None,
            };
            watch(config, app_id, submission).await?
        }
        Command::Decode { payload } => {
            let command = LedCommand::decode(&payload)?;
            println!("applicationID: {}", command.application_id);
            println!("command:       {}", command.command.name());
            println!("selector:      {}", command.command.hex());
        }
        Command::Encode { app_id, command } => {
            let Some(method) = LedMethod::from_name(&command) else {
                bail!("Unknown command {command}, expected turnOn or turnOff");
            };
            let command = LedCommand::new(app_id.unwrap_or(config.application_id), method);
            println!("{}", command.encode()?);
        }
        Command::State { app_id } => {
            let indexers = index_clients(&config)?;
            let reader = state_reader(&config, &indexers);
            let state = reader.read_current_state(app_id.unwrap_or(config.application_id)).await?;
            println!("{state}");
        }
        Command::Submit { file, wait_rounds } => submit(config, file, wait_rounds).await?,
        Command::Selector { signature } => {
            println!("{}", selector_for_signature(&signature).hex());
        }
    }

    Ok(())
}
