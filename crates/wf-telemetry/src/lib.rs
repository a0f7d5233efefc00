use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

const EVENT_QUEUE_CAPACITY: usize = 256;
const MAX_EVENT_BYTES: u64 = 2 * 1024 * 1024;

#[derive(Clone)]
pub struct TelemetryOptions {
    pub app_name: &'static str,
    pub app_version: &'static str,
    pub usage_enabled: bool,
    pub crash_enabled: bool,
    /// Root under which `telemetry/<app>/` is created.
    pub root: PathBuf,
}

pub struct Telemetry {
    app_name: String,
    app_version: String,
    session_id: String,
    dir: PathBuf,
    usage_enabled: AtomicBool,
    crash_enabled: AtomicBool,
    sender: SyncSender<TelemetryEvent>,
}

#[derive(Serialize)]
struct TelemetryEvent {
    event_type: String,
    at_unix_millis: i64,
    app: String,
    version: String,
    session_id: String,
    properties: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct CrashReport {
    at_unix_millis: i64,
    app: String,
    version: String,
    session_id: String,
    message: String,
    location: Option<String>,
    backtrace: Option<String>,
}

static TELEMETRY: OnceLock<Arc<Telemetry>> = OnceLock::new();

/// Installs the process-wide recorder. Later calls only update the flags.
pub fn init(options: TelemetryOptions) -> Arc<Telemetry> {
    if let Some(existing) = TELEMETRY.get() {
        existing.set_flags(options.usage_enabled, options.crash_enabled);
        return Arc::clone(existing);
    }

    let (telemetry, receiver) = Telemetry::new(options);
    let telemetry = Arc::new(telemetry);
    start_writer_thread(telemetry.dir.clone(), receiver);
    install_panic_hook(Arc::clone(&telemetry));

    let _ = TELEMETRY.set(Arc::clone(&telemetry));
    telemetry
}

pub fn init_with_env(app_name: &'static str, app_version: &'static str, root: PathBuf) {
    init(TelemetryOptions {
        app_name,
        app_version,
        usage_enabled: env_flag("WATCHFIRE_TELEMETRY"),
        crash_enabled: env_flag("WATCHFIRE_TELEMETRY_CRASH"),
        root,
    });
}

pub fn event(event_type: &str, properties: &[(&str, &str)]) {
    if let Some(telemetry) = TELEMETRY.get() {
        if let Some(event) = telemetry.build_event(event_type, properties) {
            let _ = telemetry.sender.try_send(event);
        }
    }
}

impl Telemetry {
    fn new(options: TelemetryOptions) -> (Self, Receiver<TelemetryEvent>) {
        let (sender, receiver) = sync_channel(EVENT_QUEUE_CAPACITY);
        let telemetry = Self {
            app_name: options.app_name.to_string(),
            app_version: options.app_version.to_string(),
            session_id: new_session_id(),
            dir: options.root.join("telemetry").join(options.app_name),
            usage_enabled: AtomicBool::new(options.usage_enabled),
            crash_enabled: AtomicBool::new(options.crash_enabled),
            sender,
        };
        (telemetry, receiver)
    }

    fn set_flags(&self, usage_enabled: bool, crash_enabled: bool) {
        self.usage_enabled.store(usage_enabled, Ordering::Relaxed);
        self.crash_enabled.store(crash_enabled, Ordering::Relaxed);
    }

    fn build_event(&self, event_type: &str, properties: &[(&str, &str)]) -> Option<TelemetryEvent> {
        if !self.usage_enabled.load(Ordering::Relaxed) {
            return None;
        }
        let properties = properties
            .iter()
            .filter(|(key, _)| !key.trim().is_empty())
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        Some(TelemetryEvent {
            event_type: event_type.to_string(),
            at_unix_millis: now_millis(),
            app: self.app_name.clone(),
            version: self.app_version.clone(),
            session_id: self.session_id.clone(),
            properties,
        })
    }

    fn crash_report(&self, message: String, location: Option<String>, backtrace: Option<String>) {
        if !self.crash_enabled.load(Ordering::Relaxed) {
            return;
        }
        let report = CrashReport {
            at_unix_millis: now_millis(),
            app: self.app_name.clone(),
            version: self.app_version.clone(),
            session_id: self.session_id.clone(),
            message,
            location,
            backtrace,
        };
        write_crash_report(&self.dir, &report);
    }
}

fn start_writer_thread(dir: PathBuf, receiver: Receiver<TelemetryEvent>) {
    std::thread::spawn(move || {
        while let Ok(event) = receiver.recv() {
            write_event(&dir, &event);
        }
    });
}

fn install_panic_hook(telemetry: Arc<Telemetry>) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = if let Some(msg) = info.payload().downcast_ref::<&str>() {
            (*msg).to_string()
        } else if let Some(msg) = info.payload().downcast_ref::<String>() {
            msg.clone()
        } else {
            "panic".to_string()
        };
        let location = info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()));
        let backtrace = Some(format!("{:?}", std::backtrace::Backtrace::capture()));
        telemetry.crash_report(message, location, backtrace);
        default_hook(info);
    }));
}

fn write_event(dir: &Path, event: &TelemetryEvent) {
    if let Err(err) = fs::create_dir_all(dir) {
        eprintln!("telemetry: failed to create {}: {err}", dir.display());
        return;
    }

    let path = dir.join("events.jsonl");
    if rotate_if_needed(&path).is_err() {
        return;
    }

    let mut file = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("telemetry: failed to open {}: {err}", path.display());
            return;
        }
    };
    if let Ok(line) = serde_json::to_string(event) {
        let _ = writeln!(file, "{line}");
    }
}

fn rotate_if_needed(path: &Path) -> std::io::Result<()> {
    if let Ok(meta) = fs::metadata(path) {
        if meta.len() >= MAX_EVENT_BYTES {
            let rotated = path.with_extension("jsonl.1");
            let _ = fs::remove_file(&rotated);
            fs::rename(path, rotated)?;
        }
    }
    Ok(())
}

fn write_crash_report(dir: &Path, report: &CrashReport) {
    let dir = dir.join("crashes");
    if let Err(err) = fs::create_dir_all(&dir) {
        eprintln!("telemetry: failed to create {}: {err}", dir.display());
        return;
    }
    let filename = format!(
        "crash-{}-{}.json",
        report.at_unix_millis,
        std::process::id()
    );
    if let Ok(file) = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dir.join(filename))
    {
        let _ = serde_json::to_writer_pretty(file, report);
    }
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn new_session_id() -> String {
    format!("{:x}-{:x}", now_millis(), std::process::id())
}
