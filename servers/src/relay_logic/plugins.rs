//! Built-in callback workers.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use lib_relay::core::{CallbackDispatcher, Tick, TickHandler};
use lib_relay::sources::TelemetryFrame;

use crate::relay_logic::config::Config;

/// Appends every non-empty tick to a JSON-lines file that playback can replay.
pub struct TickRecorder {
    path: PathBuf,
    writer: BufWriter<File>,
    written: u64,
}

impl TickRecorder {
    /// Creates `recording_<timestamp>.jsonl` inside `dir`.
    pub fn create_in(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
        Self::open(dir.join(format!("recording_{stamp}.jsonl")))
    }

    pub fn open(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::info!("Recording ticks to {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_tick(&mut self, tick: &Tick) -> io::Result<()> {
        let Some(id) = tick.id else {
            // Source down: a good moment to get buffered frames onto disk.
            return self.writer.flush();
        };
        if tick.values.is_empty() {
            return Ok(());
        }
        let frame = TelemetryFrame::from_values(id, &tick.values);
        serde_json::to_writer(&mut self.writer, &frame)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }
}

impl TickHandler for TickRecorder {
    fn on_tick(&mut self, tick: Tick) -> bool {
        match self.write_tick(&tick) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Recorder {} failed, stopping: {}", self.path.display(), e);
                false
            }
        }
    }

    fn on_stop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::error!("Recorder {} flush failed: {}", self.path.display(), e);
        }
        tracing::info!("Recorder wrote {} frame(s) to {}", self.written, self.path.display());
    }
}

/// Logs source up/down transitions as seen by the worker side.
#[derive(Debug, Default)]
pub struct SourceWatch {
    up: Option<bool>,
    transitions: u64,
}

impl SourceWatch {
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    fn observe(&mut self, tick: &Tick) {
        let up = !tick.is_idle();
        if self.up == Some(up) {
            return;
        }
        if up {
            tracing::info!("Telemetry source up (tick {:?})", tick.id);
        } else {
            tracing::warn!("Telemetry source down");
        }
        if self.up.is_some() {
            self.transitions += 1;
        }
        self.up = Some(up);
    }
}

impl TickHandler for SourceWatch {
    fn on_tick(&mut self, tick: Tick) -> bool {
        self.observe(&tick);
        true
    }
}

/// Registers the built-in workers the configuration asks for.
pub fn register_plugins(config: &Config, dispatcher: &CallbackDispatcher) -> anyhow::Result<()> {
    dispatcher.spawn_worker("source-watch", Vec::<String>::new(), SourceWatch::default())?;

    if let Some(dir) = &config.record_path {
        let recorder = TickRecorder::create_in(dir)?;
        dispatcher.spawn_worker("recorder", config.record_paths(), recorder)?;
    }
    Ok(())
}
