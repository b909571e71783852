#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tls_context::{ContextBuilder, MessageSink, StaticEnvironment};
use tracing_subscriber::filter::EnvFilter;

pub const CA_CERT: &str = include_str!("../data/ca.pem");
pub const HOST_CERT: &str = include_str!("../data/host.pem");
pub const HOST_KEY: &str = include_str!("../data/host.key");
pub const OTHER_KEY: &str = include_str!("../data/other.key");

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Default)]
pub struct Recorder(Mutex<Vec<(String, String, bool)>>);

impl Recorder {
    pub fn texts(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text, _)| text.clone())
            .collect()
    }
}

impl MessageSink for Recorder {
    fn message(&self, component: &str, text: &str, is_error: bool) {
        self.0
            .lock()
            .unwrap()
            .push((component.to_owned(), text.to_owned(), is_error));
    }
}

pub fn builder(env: StaticEnvironment) -> (ContextBuilder, Arc<Recorder>) {
    init_logging();
    let sink = Arc::new(Recorder::default());
    let builder = ContextBuilder::new()
        .with_sink(sink.clone())
        .with_environment(Arc::new(env));
    (builder, sink)
}

pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        chmod(dir.path(), 0o755);
        Self { dir }
    }

    pub fn file(&self, name: &str, contents: &str, mode: u32) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, contents).unwrap();
        chmod(&path, mode);
        path
    }

    pub fn cadir(&self) -> PathBuf {
        let path = self.dir.path().join("ca");
        fs::create_dir(&path).unwrap();
        chmod(&path, 0o755);
        fs::write(path.join("0a1b2c3d.0"), CA_CERT).unwrap();
        path
    }
}

pub fn chmod(path: &Path, mode: u32) {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}
