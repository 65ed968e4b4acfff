//! CLI for mqtt-flow
//!
//! Subcommands:
//! - `server`: run the broker
//! - `publish`: publish one message and exit
//! - `subscribe`: print messages on the given topic filters until Ctrl-C

use std::sync::Arc;

use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

use mqtt_flow::broker::Broker;
use mqtt_flow::client::{ApplicationMessage, MqttClient};
use mqtt_flow::config::{Settings, load_config};
use mqtt_flow::packet::{QoS, TopicSubscription};
use mqtt_flow::persistence::RepositoryProvider;
use mqtt_flow::transport::ByteChannel;

#[derive(Parser)]
#[command(name = "mqtt-flow")]
enum Command {
    /// Start the broker
    Server,
    /// Publish one message to the broker
    Publish {
        topic: String,
        message: String,
        /// QoS level: 0, 1 or 2
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
        #[arg(long)]
        retain: bool,
        #[arg(long, default_value = "mqtt-flow-publisher")]
        client_id: String,
    },
    /// Subscribe to topic filters and print what arrives
    Subscribe {
        #[arg(required = true)]
        topics: Vec<String>,
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
        #[arg(long, default_value = "mqtt-flow-subscriber")]
        client_id: String,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    mqtt_flow::utils::logging::init("info");

    let cmd = Command::parse();
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let outcome = match cmd {
        Command::Server => run_server(config).await,
        Command::Publish {
            topic,
            message,
            qos,
            retain,
            client_id,
        } => run_publish(config, client_id, topic, message, qos, retain).await,
        Command::Subscribe {
            topics,
            qos,
            client_id,
        } => run_subscribe(config, client_id, topics, qos).await,
    };

    if let Err(e) = outcome {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_server(config: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let repositories = RepositoryProvider::from_settings(&config.storage)?;
    let broker = Broker::new(config.protocol.clone(), repositories, None)?;
    let listener = TcpListener::bind(config.server.address()).await?;

    tokio::select! {
        served = broker.serve(listener) => {
            if let Err(e) = served {
                error!("Broker stopped accepting connections: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    broker.stop().await;
    Ok(())
}

async fn connect(
    config: &Settings,
    client_id: String,
) -> Result<MqttClient, Box<dyn std::error::Error>> {
    let stream = TcpStream::connect(config.server.address()).await?;
    // the broker may hold the sled database; command line clients stay in memory
    let repositories = RepositoryProvider::in_memory();
    let client = MqttClient::new(
        client_id,
        ByteChannel::tcp(stream),
        &config.protocol,
        repositories.sessions,
    )?;
    client.connect(None, None, true).await?;
    Ok(client)
}

async fn run_publish(
    config: Settings,
    client_id: String,
    topic: String,
    message: String,
    qos: u8,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = connect(&config, client_id).await?;
    client
        .publish(ApplicationMessage::new(topic, message), QoS::try_from(qos)?, retain)
        .await?;
    client.disconnect().await?;
    Ok(())
}

async fn run_subscribe(
    config: Settings,
    client_id: String,
    topics: Vec<String>,
    qos: u8,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::try_from(qos)?;
    let client = Arc::new(connect(&config, client_id).await?);
    let mut messages = client.messages();
    let granted = client
        .subscribe(
            topics
                .iter()
                .map(|topic| TopicSubscription::new(topic.as_str(), qos))
                .collect(),
        )
        .await?;
    info!("Subscribed: {:?}", granted);

    loop {
        tokio::select! {
            received = messages.recv() => match received {
                Ok(message) => println!("{}: {}", message.topic, message.payload_str()),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    info!("Skipped {} messages", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
        if !client.is_connected() {
            break;
        }
    }

    client.disconnect().await?;
    Ok(())
}
