use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;

use smartcontrol::config::{DEFAULT_DEVICE_TYPE, DEFAULT_MQTT_PORT};
use smartcontrol::{ConnParams, ControlError, Controller, ControllerBuilder};

/// Command line interface for zTC1-style smart plugs
#[derive(Parser)]
#[clap(
    name = "smartcontrol",
    about = "Controls zTC1 smart plugs over UDP and MQTT",
    version = smartcontrol::VERSION
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

/// MQTT broker settings shared by every subcommand that needs them
#[derive(Args, Clone)]
pub struct BrokerArgs {
    /// MQTT broker host
    #[clap(long, default_value = "0.0.0.0")]
    uri: String,

    /// MQTT broker port
    #[clap(long, default_value_t = DEFAULT_MQTT_PORT)]
    port: u16,

    /// MQTT username
    #[clap(long)]
    username: Option<String>,

    /// MQTT password
    #[clap(long)]
    password: Option<String>,
}

impl BrokerArgs {
    fn conn(&self) -> ConnParams {
        ConnParams::new(self.uri.clone(), self.port)
            .with_credentials(self.username.clone(), self.password.clone())
    }
}

/// Kind of telemetry to monitor
#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum MonitorKind {
    /// Power draw and uptime, until interrupted
    Power,
    /// Current on/off state of every plug
    State,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ask devices on the local network to report themselves
    Discover {
        /// Search timeout in seconds
        #[clap(short = 't', long = "timeout", default_value_t = 30)]
        timeout: u64,
    },
    /// Send local MQTT server information to a device
    Adopt {
        /// Device mac address
        #[clap(long)]
        mac: String,

        #[clap(flatten)]
        broker: BrokerArgs,
    },
    /// Activate a device by code, it requires the device has been adopted
    Activate {
        #[clap(long)]
        mac: String,

        /// Activation code
        #[clap(long)]
        code: String,

        #[clap(long, default_value = DEFAULT_DEVICE_TYPE)]
        device: String,

        #[clap(flatten)]
        broker: BrokerArgs,
    },
    /// Monitor device status
    Monitor {
        #[clap(long)]
        mac: String,

        #[clap(long, default_value = DEFAULT_DEVICE_TYPE)]
        device: String,

        #[clap(long, value_enum, default_value_t = MonitorKind::State)]
        monitor: MonitorKind,

        /// Give up waiting for a state report after this many seconds
        #[clap(long)]
        timeout: Option<u64>,

        #[clap(flatten)]
        broker: BrokerArgs,
    },
    /// Switch a specific plug on/off
    Switch {
        #[clap(long)]
        mac: String,

        #[clap(long, default_value = DEFAULT_DEVICE_TYPE)]
        device: String,

        /// Plug index, 0 to 5
        #[clap(long, default_value_t = 0, allow_negative_numbers = true)]
        plug: i64,

        /// Switch the plug on; off when omitted
        #[clap(long)]
        on: bool,

        /// Give up waiting for the state read-back after this many seconds
        #[clap(long)]
        timeout: Option<u64>,

        #[clap(flatten)]
        broker: BrokerArgs,
    },
    /// Upgrade a device to a certain firmware
    Upgrade {
        #[clap(long)]
        mac: String,

        #[clap(long, default_value = DEFAULT_DEVICE_TYPE)]
        device: String,

        /// Firmware image address
        #[clap(long)]
        ota: String,

        /// Give up when no completion is reported within this many seconds
        #[clap(long)]
        timeout: Option<u64>,

        #[clap(flatten)]
        broker: BrokerArgs,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match handle_cli(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", describe(&e));
            ExitCode::FAILURE
        }
    }
}

fn describe(err: &ControlError) -> String {
    match err {
        ControlError::Timeout(_) => format!("{}, UDP is not reliable, you may try again later", err),
        ControlError::InvalidPlugIndex(_) => err.to_string(),
        ControlError::Fallback { .. } => format!("Command not delivered: {}", err),
        _ => format!("Operation failed: {}", err),
    }
}

fn controller(broker: &BrokerArgs, device: &str, state_timeout: Option<u64>) -> Controller {
    ControllerBuilder::new(broker.conn())
        .device_type(device)
        .state_timeout(state_timeout.map(Duration::from_secs))
        .build()
}

async fn handle_cli(cli: Cli) -> smartcontrol::Result<()> {
    match cli.command {
        Commands::Discover { timeout } => {
            let controller = ControllerBuilder::new(ConnParams::new("0.0.0.0", DEFAULT_MQTT_PORT))
                .discover_timeout(Duration::from_secs(timeout))
                .build();
            print!("Broadcast to the local area network, wait for device to report.");
            let device = controller
                .discover_with_progress(|| {
                    print!(".");
                    let _ = std::io::stdout().flush();
                })
                .await;
            println!();
            println!("Device found! {}", device?);
        }
        Commands::Adopt { mac, broker } => {
            controller(&broker, DEFAULT_DEVICE_TYPE, None).adopt(&mac).await?;
            println!("Adopt by sending MQTT server information to device");
        }
        Commands::Activate {
            mac,
            code,
            device,
            broker,
        } => {
            let delivery = controller(&broker, &device, None).activate(&mac, &code).await?;
            println!("Activation code {}", delivery);
        }
        Commands::Monitor {
            mac,
            device,
            monitor,
            timeout,
            broker,
        } => {
            let controller = controller(&broker, &device, timeout);
            match monitor {
                MonitorKind::State => print!("{}", controller.plug_state(&mac).await?),
                MonitorKind::Power => {
                    let readings = controller.power_readings(&mac).await?;
                    tokio::pin!(readings);
                    loop {
                        tokio::select! {
                            reading = readings.next() => match reading {
                                Some(reading) => println!("{}", reading),
                                None => break,
                            },
                            _ = tokio::signal::ctrl_c() => break,
                        }
                    }
                }
            }
        }
        Commands::Switch {
            mac,
            device,
            plug,
            on,
            timeout,
            broker,
        } => {
            let outcome = controller(&broker, &device, timeout).switch(&mac, plug, on).await?;
            print!("{}", outcome);
        }
        Commands::Upgrade {
            mac,
            device,
            ota,
            timeout,
            broker,
        } => {
            ControllerBuilder::new(broker.conn())
                .device_type(device)
                .upgrade_timeout(timeout.map(Duration::from_secs))
                .build()
                .upgrade(&mac, &ota, |progress| {
                    println!("Upgrade progress: {}%", progress)
                })
                .await?;
            println!("Upgrade finished");
        }
    }
    Ok(())
}
