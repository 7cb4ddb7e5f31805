use anyhow::{anyhow, Context, Result};
use clap::ArgMatches;
use log::{info, warn};
use std::time::Duration;

use crate::config::EndpointConfig;
use crate::modbus::{ModbusClientTrait, PlcClient};
use crate::output::{
    forward, ConsoleFormatter, ConsoleSender, CsvFormatter, DataFormatter, DataSender, FileSender, JsonFormatter,
};
use crate::services::events::{EventFilter, EventKind, PlcEvent};
use crate::utils::error::ModbusError;

/// Endpoint settings from `--config`, or from the individual flags.
pub fn endpoint_from_matches(matches: &ArgMatches) -> Result<EndpointConfig> {
    if let Some(path) = matches.get_one::<String>("config") {
        return EndpointConfig::from_file(path).with_context(|| format!("loading {}", path));
    }

    let host = matches
        .get_one::<String>("host")
        .ok_or_else(|| anyhow!("either --config or --host is required"))?;
    let name = matches
        .get_one::<String>("name")
        .cloned()
        .unwrap_or_else(|| host.clone());

    let mut config = EndpointConfig::new(name, host.as_str());
    if let Some(port) = matches.get_one::<u16>("port") {
        config = config.with_port(*port);
    }
    if let Some(unit) = matches.get_one::<u8>("unit") {
        config = config.with_unit_id(*unit);
    }
    Ok(config.build()?)
}

fn formatter_from_matches(matches: &ArgMatches) -> Box<dyn DataFormatter> {
    match matches.get_one::<String>("format").map(String::as_str) {
        Some("json") => {
            info!("🎨 Using JSON formatter");
            Box::new(JsonFormatter)
        }
        Some("csv") => {
            info!("🎨 Using CSV formatter");
            Box::new(CsvFormatter)
        }
        _ => Box::new(ConsoleFormatter),
    }
}

fn senders_from_matches(matches: &ArgMatches) -> Vec<Box<dyn DataSender>> {
    let mut senders: Vec<Box<dyn DataSender>> = vec![Box::new(ConsoleSender)];
    if let Some(output_file) = matches.get_one::<String>("output-file") {
        info!("📝 Adding file output: {}", output_file);
        senders.push(Box::new(FileSender::new(output_file, true)));
    }
    senders
}

/// Dispatches the selected subcommand. Returns `false` when none matched.
pub async fn handle_subcommands(matches: &ArgMatches) -> Result<bool> {
    let Some((name, sub)) = matches.subcommand() else {
        return Ok(false);
    };

    let config = endpoint_from_matches(matches)?;
    if name == "check-config" {
        println!("✅ Endpoint '{}' is valid\n", config.name);
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(true);
    }

    let formatter = formatter_from_matches(matches);
    let senders = senders_from_matches(matches);

    let client = PlcClient::new(config)?;
    client
        .connect()
        .await
        .with_context(|| format!("connecting to {}:{}", client.config().host, client.config().port))?;

    let outcome = if name == "monitor" {
        monitor(&client, sub, formatter.as_ref(), &senders).await
    } else {
        let mut events = client.subscribe(EventFilter::only([EventKind::Data, EventKind::Write]));
        let result = run_once(&client, name, sub).await;

        let mut batch: Vec<PlcEvent> = Vec::new();
        while let Some(event) = events.try_recv() {
            batch.push(event);
        }
        if !batch.is_empty() {
            deliver(&render_batch(formatter.as_ref(), &batch), &senders).await;
        }
        result
    };

    client.disconnect().await;
    outcome.map(|()| true)
}

async fn run_once(client: &dyn ModbusClientTrait, name: &str, sub: &ArgMatches) -> Result<()> {
    let address = *sub.get_one::<u16>("address").ok_or_else(|| anyhow!("missing address"))?;
    let quantity = || sub.get_one::<u16>("quantity").copied().ok_or_else(|| anyhow!("missing quantity"));

    match name {
        "read-holding" => {
            client.read_holding_registers(address, quantity()?).await?;
        }
        "read-input" => {
            client.read_input_registers(address, quantity()?).await?;
        }
        "read-coils" => {
            client.read_coils(address, quantity()?).await?;
        }
        "read-discrete" => {
            client.read_discrete_inputs(address, quantity()?).await?;
        }
        "write-register" => {
            let value = *sub.get_one::<u16>("value").ok_or_else(|| anyhow!("missing value"))?;
            client.write_single_register(address, value).await?;
        }
        "write-registers" => {
            let values: Vec<u16> = sub.get_many::<u16>("values").into_iter().flatten().copied().collect();
            client.write_multiple_registers(address, &values).await?;
        }
        "write-coil" => {
            let state = sub.get_one::<String>("state").ok_or_else(|| anyhow!("missing state"))?;
            let on = matches!(state.as_str(), "on" | "true" | "1");
            client.write_single_coil(address, on).await?;
        }
        other => return Err(anyhow!("unknown command '{}'", other)),
    }
    Ok(())
}

async fn monitor(
    client: &PlcClient,
    sub: &ArgMatches,
    formatter: &dyn DataFormatter,
    senders: &[Box<dyn DataSender>],
) -> Result<()> {
    let address = *sub.get_one::<u16>("address").ok_or_else(|| anyhow!("missing address"))?;
    let quantity = *sub.get_one::<u16>("quantity").ok_or_else(|| anyhow!("missing quantity"))?;
    let table = sub.get_one::<String>("table").map(String::as_str).unwrap_or("holding");
    let period = Duration::from_millis(*sub.get_one::<u64>("interval-ms").unwrap_or(&1000));

    info!(
        "📡 Monitoring {} x{} @ {} every {:?} (Ctrl+C to stop)",
        table, quantity, address, period
    );

    let events = client.subscribe(EventFilter::All);
    let pump = forward(events, formatter, senders);
    tokio::pin!(pump);

    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = match table {
                    "input" => client.read_input_registers(address, quantity).await.map(|_| ()),
                    "coils" => client.read_coils(address, quantity).await.map(|_| ()),
                    "discrete" => client.read_discrete_inputs(address, quantity).await.map(|_| ()),
                    _ => client.read_holding_registers(address, quantity).await.map(|_| ()),
                };
                if let Err(e) = result {
                    warn!("⚠️  Poll failed: {}", e);
                }
            }
            _ = &mut pump => break,
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Stopping monitor");
                break;
            }
        }
    }
    Ok(())
}

/// Formats a one-shot batch, led by the formatter's header if it has one.
fn render_batch(formatter: &dyn DataFormatter, batch: &[PlcEvent]) -> String {
    let header = formatter.format_header();
    let body = formatter.format_batch(batch);
    if header.is_empty() {
        body
    } else {
        format!("{}\n{}", header, body)
    }
}

/// Operator hint for failures caused by a timeout anywhere in the chain.
pub fn failure_hint(err: &anyhow::Error) -> Option<&'static str> {
    let timed_out = err.chain().filter_map(|cause| cause.downcast_ref::<ModbusError>()).any(|e| match e {
        ModbusError::ConnectionFailed { last, .. } => last.is_timeout(),
        other => other.is_timeout(),
    });
    timed_out.then_some("the PLC did not answer in time; check that it is reachable or raise the timeouts in the config")
}

async fn deliver(text: &str, senders: &[Box<dyn DataSender>]) {
    for sender in senders {
        if let Err(e) = sender.send(text).await {
            warn!("⚠️  {} sender {} failed: {}", sender.sender_type(), sender.destination(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::build_cli;
    use crate::services::events::{Quality, SignalDataPoint, SignalValue};
    use chrono::Utc;

    #[test]
    fn test_endpoint_from_flags() {
        let matches = build_cli()
            .try_get_matches_from(["plc-link", "--host", "192.168.0.20", "--port", "1502", "--unit", "7", "check-config"])
            .unwrap();
        let config = endpoint_from_matches(&matches).unwrap();
        assert_eq!(config.name, "192.168.0.20");
        assert_eq!(config.port, 1502);
        assert_eq!(config.unit_id, 7);
    }

    #[test]
    fn test_endpoint_requires_host_or_config() {
        let matches = build_cli().try_get_matches_from(["plc-link", "check-config"]).unwrap();
        assert!(endpoint_from_matches(&matches).is_err());
    }

    #[test]
    fn test_endpoint_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plc.toml");
        EndpointConfig::new("press-1", "10.1.1.1").save_to_file(&path).unwrap();

        let matches = build_cli()
            .try_get_matches_from(["plc-link", "--config", path.to_str().unwrap(), "check-config"])
            .unwrap();
        assert_eq!(endpoint_from_matches(&matches).unwrap().name, "press-1");
    }

    #[test]
    fn test_csv_batch_starts_with_header() {
        let point = SignalDataPoint {
            timestamp: Utc::now(),
            address: 40,
            value: SignalValue::Number(12),
            quality: Quality::Good,
            device_name: "press-1".to_string(),
            signal_name: Some("HR40".to_string()),
        };
        let batch = vec![PlcEvent::Data(point.clone()), PlcEvent::Data(point)];

        let text = render_batch(&CsvFormatter, &batch);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], CsvFormatter.format_header());
        assert_eq!(lines.len(), 3);

        let json = render_batch(&JsonFormatter, &batch);
        assert_eq!(json, JsonFormatter.format_batch(&batch));
    }

    #[test]
    fn test_failure_hint_only_for_timeouts() {
        let timeout = anyhow::Error::new(ModbusError::RequestTimeout { transaction_id: 3 }).context("reading");
        assert!(failure_hint(&timeout).is_some());

        let connect = anyhow::Error::new(ModbusError::ConnectionFailed {
            attempts: 3,
            last: Box::new(ModbusError::ConnectionTimeout(500)),
        });
        assert!(failure_hint(&connect).is_some());

        let exception = anyhow::Error::new(ModbusError::ProtocolException { function: 3, code: 2 });
        assert!(failure_hint(&exception).is_none());
    }
}
