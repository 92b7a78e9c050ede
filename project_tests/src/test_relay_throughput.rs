use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Counts /stream pushes from a running relay", long_about = None)]
struct Args {
    /// Relay address
    #[clap(long, default_value = "ws://127.0.0.1:9010")]
    url: String,

    /// Push cadence requested from the relay, in milliseconds
    #[clap(long, default_value_t = 50)]
    cadence_ms: u64,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 10)]
    report_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let url = format!("{}/stream?cadence_ms={}", args.url, args.cadence_ms);
    let (mut ws, _) = connect_async(url.as_str()).await?;
    println!("Connected to {}", url);

    let subscribe = json!({
        "Subscribe": {
            "car": {
                "speed": {"Name": "/Car/ME/Speed", "UOM": "km/h", "Format": "0.0", "Interval": 16},
                "rpm": {"Name": "/Car/ME/Rpm", "Interval": 16},
                "gear": {"Name": "/Car/ME/Gear", "Interval": 100}
            },
            "session": {
                "flag": {"Name": "/Session/Flag", "Interval": 1000}
            }
        }
    });
    ws.send(Message::text(subscribe.to_string())).await?;

    let window = chrono::Duration::seconds(args.report_interval_secs as i64);
    let mut pushes: VecDeque<chrono::DateTime<Utc>> = VecDeque::new();
    let mut report = tokio::time::interval(Duration::from_secs(args.report_interval_secs));
    report.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                let cutoff = Utc::now() - window;
                while pushes.front().map_or(false, |&t| t < cutoff) {
                    pushes.pop_front();
                }
                println!(
                    "[{}] {} push(es) in the last {}s ({:.1}/s)",
                    Utc::now().format("%H:%M:%S"),
                    pushes.len(),
                    args.report_interval_secs,
                    pushes.len() as f64 / args.report_interval_secs as f64
                );
            }
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(diff) = serde_json::from_str::<Value>(text.as_str()) {
                        if diff.as_object().is_some_and(|groups| !groups.is_empty()) {
                            pushes.push_back(Utc::now());
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    println!("Relay closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = ws.close(None).await;
    Ok(())
}
