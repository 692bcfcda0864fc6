use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::PathBuf,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use log::{Level, LevelFilter, Log, Metadata, Record};
use serde_json::json;

pub const JSON_PATH_ENV: &str = "SCREEN_REPLAY_LOG_JSON_PATH";

pub struct Logger {
    level: LevelFilter,
    json_file: Option<Mutex<File>>,
}

impl Logger {
    pub fn new(level: LevelFilter, path: Option<PathBuf>) -> Result<Self> {
        let path = path.or_else(|| std::env::var(JSON_PATH_ENV).ok().map(PathBuf::from));
        let json_file = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("failed to open log file {}", path.display()))?;
                Some(Mutex::new(file))
            }
            None => None,
        };
        Ok(Self { level, json_file })
    }

    pub fn install(self) -> Result<()> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self))
            .map_err(|err| anyhow::anyhow!("logger already installed: {err}"))?;
        log::set_max_level(level);
        Ok(())
    }

    fn event(&self, level: Level, target: &str, message: &str) {
        let Some(file) = &self.json_file else {
            return;
        };
        let Ok(mut file) = file.lock() else {
            return;
        };

        let ts_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let entry = json!({
            "ts_ms": ts_ms,
            "level": level.as_str().to_ascii_lowercase(),
            "target": target,
            "msg": message,
        });

        let _ = writeln!(file, "{}", entry);
        let _ = file.flush();
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = record.args().to_string();
        eprintln!("[{}] {}", record.level(), message);
        self.event(record.level(), record.target(), &message);
    }

    fn flush(&self) {
        if let Some(file) = &self.json_file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_lines_carry_level_and_message() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("replay.jsonl");
        let logger = Logger::new(LevelFilter::Debug, Some(path.clone())).expect("logger");

        logger.log(
            &Record::builder()
                .level(Level::Warn)
                .target("strokescreen")
                .args(format_args!("accel sample dropped"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Trace)
                .args(format_args!("filtered"))
                .build(),
        );

        let raw = fs::read_to_string(&path).expect("log file written");
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|line| serde_json::from_str(line).expect("valid json line"))
            .collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["level"], "warn");
        assert_eq!(lines[0]["target"], "strokescreen");
        assert_eq!(lines[0]["msg"], "accel sample dropped");
    }
}
