//! Core application runner for `sense-ble-gateway`.
//!
//! This module is decoupled from process setup (logging, exit codes) so the
//! startup sequence can be tested with an injected scanner, ingress client
//! and shutdown trigger.

use crate::config::{self, Config, ConfigError, TOKEN_FILE_NAME};
use crate::credential::{CredentialError, CredentialManager, Startup, TokenStore};
use crate::event::EventBuilder;
use crate::ingress::{DEFAULT_REQUEST_TIMEOUT, DeliveryError, HttpIngress, IngressApi};
use crate::pipeline::{DevicePattern, Pipeline};
use crate::scanner::{Backend, RealScanner, ScanError, Scanner};
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Command line options.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Register with the ingress API (to replace a bad token, for instance),
    /// save the token, then quit without scanning
    #[arg(long)]
    pub force_register: bool,

    /// Configuration file [default: ~/.sense/ble-client-conf.json]
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Token file [default: ~/.sense/ble-client-jwt]
    #[arg(long, value_name = "PATH")]
    pub token_file: Option<PathBuf>,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Timeout for each request to the ingress API.
    /// Accepts duration with suffix: 3s, 1m, 500ms.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, value_parser = crate::duration::parse_duration, default_value = "10s")]
    pub request_timeout: Duration,

    /// Verbose output, log every decoded record
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            force_register: false,
            config: None,
            token_file: None,
            backend: Backend::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            verbose: false,
        }
    }
}

/// Errors returned by the core run loop. All of them are fatal.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Ingress(#[from] DeliveryError),
}

/// Resolve paths, load the configuration and run until `shutdown` resolves.
pub async fn run(options: Options, shutdown: impl Future<Output = ()>) -> Result<(), RunError> {
    let config_path = match &options.config {
        Some(path) => path.clone(),
        None => config::default_dir()?.join(config::CONFIG_FILE_NAME),
    };
    let token_path = match &options.token_file {
        Some(path) => path.clone(),
        None => config::default_dir()?.join(TOKEN_FILE_NAME),
    };

    let config = Config::load(&config_path)?;
    info!(path = %config_path.display(), ingress = %config.ingress_address, "configuration loaded");

    let ingress = HttpIngress::new(&config.ingress_address, options.request_timeout)?;

    run_with(
        &options,
        &config,
        TokenStore::new(token_path),
        &RealScanner,
        &ingress,
        shutdown,
    )
    .await
}

/// Obtain a credential, then scan and forward events until `shutdown`
/// resolves.
///
/// With `options.force_register` this returns right after registration
/// without starting the scanner. A scanner that closes its stream first is
/// reported as [`ScanError::Stopped`].
pub async fn run_with(
    options: &Options,
    config: &Config,
    store: TokenStore,
    scanner: &dyn Scanner,
    ingress: &dyn IngressApi,
    shutdown: impl Future<Output = ()>,
) -> Result<(), RunError> {
    let manager = CredentialManager::new(store, ingress, config.api_key.clone());
    let credential = match manager.load_or_register(options.force_register).await? {
        Startup::Ready(credential) => credential,
        Startup::RegisteredOnly(_) => {
            info!("registration complete, exiting");
            return Ok(());
        }
    };

    info!(backend = %options.backend, "starting scan");
    let mut advertisements = scanner.start_scan(options.backend).await?;

    let pipeline = Pipeline::new(
        DevicePattern::default(),
        EventBuilder::new(&config.temperature_unit),
        ingress,
        credential,
    );

    tokio::select! {
        _ = pipeline.run(&mut advertisements) => {
            tracing::error!("advertisement stream closed");
            Err(ScanError::Stopped.into())
        }
        _ = shutdown => {
            info!("shutdown requested");
            Ok(())
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "unable to listen for interrupt");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::Credential;
    use crate::event::EventKind;
    use crate::ingress::RegistrationReply;
    use crate::scanner::{Advertisements, RawAdvertisement};
    use crate::test_utils::{FakeIngress, matching_advertisement, sample_payload};
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    #[derive(Debug, Default)]
    struct FakeScanner {
        advertisements: Mutex<Vec<RawAdvertisement>>,
        started: AtomicBool,
        /// Keep the channel open after sending, like a real radio.
        hold_open: bool,
    }

    impl FakeScanner {
        fn new(advertisements: Vec<RawAdvertisement>) -> Self {
            Self {
                advertisements: Mutex::new(advertisements),
                ..Default::default()
            }
        }

        /// Keeps the channel open after sending, like a real radio.
        fn open(advertisements: Vec<RawAdvertisement>) -> Self {
            Self {
                hold_open: true,
                ..Self::new(advertisements)
            }
        }
    }

    impl Scanner for FakeScanner {
        fn start_scan(
            &self,
            _backend: Backend,
        ) -> Pin<Box<dyn Future<Output = Result<Advertisements, ScanError>> + Send + '_>> {
            self.started.store(true, Ordering::SeqCst);
            let advertisements = self.advertisements.lock().unwrap().clone();
            let hold_open = self.hold_open;
            Box::pin(async move {
                let (tx, rx) = mpsc::channel(advertisements.len().max(1));
                tokio::spawn(async move {
                    for a in advertisements {
                        let _ = tx.send(a).await;
                    }
                    if hold_open {
                        tx.closed().await;
                    }
                    // drop tx to close channel
                });
                Ok(rx)
            })
        }
    }

    fn config() -> Config {
        Config {
            ingress_address: "http://ingress.invalid".to_string(),
            api_key: "api-key".to_string(),
            temperature_unit: "C".to_string(),
        }
    }

    fn never() -> impl Future<Output = ()> {
        std::future::pending()
    }

    fn soon() -> impl Future<Output = ()> {
        tokio::time::sleep(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn run_forwards_events_with_stored_token() {
        let dir = tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("jwt"));
        store.save(&Credential::new("stored")).unwrap();

        let scanner = FakeScanner::open(vec![matching_advertisement(sample_payload())]);
        let ingress = FakeIngress::new();

        run_with(&Options::default(), &config(), store, &scanner, &ingress, soon())
            .await
            .unwrap();

        assert!(scanner.started.load(Ordering::SeqCst));
        assert_eq!(ingress.registration_count(), 0);
        let events = ingress.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|(token, _)| token == "stored"));
        assert_eq!(events[0].1.id, EventKind::Temperature);
        assert_eq!(events[0].1.sensor_value, 23.5);
        assert_eq!(events[0].1.units, "C");
    }

    #[tokio::test]
    async fn run_registers_when_store_is_missing_then_scans() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jwt");

        let scanner = FakeScanner::open(vec![matching_advertisement(sample_payload())]);
        let ingress = FakeIngress::new().with_registration(Ok(RegistrationReply {
            status: 200,
            token: Some("fresh".to_string()),
        }));

        run_with(
            &Options::default(),
            &config(),
            TokenStore::new(&path),
            &scanner,
            &ingress,
            soon(),
        )
        .await
        .unwrap();

        assert_eq!(ingress.registration_count(), 1);
        assert!(scanner.started.load(Ordering::SeqCst));
        assert_eq!(ingress.event_count(), 2);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fresh");
    }

    #[tokio::test]
    async fn forced_registration_never_scans() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jwt");
        std::fs::write(&path, "old").unwrap();

        let scanner = FakeScanner::new(vec![matching_advertisement(sample_payload())]);
        let ingress = FakeIngress::new();
        let options = Options {
            force_register: true,
            ..Options::default()
        };

        run_with(&options, &config(), TokenStore::new(&path), &scanner, &ingress, never())
            .await
            .unwrap();

        assert!(!scanner.started.load(Ordering::SeqCst));
        assert_eq!(ingress.event_count(), 0);
        assert_eq!(*ingress.registrations.lock().unwrap(), vec!["api-key"]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "test-token");
    }

    #[tokio::test]
    async fn rejected_registration_is_fatal_and_never_scans() {
        let dir = tempdir().unwrap();
        let scanner = FakeScanner::new(vec![]);
        let ingress = FakeIngress::new().with_registration(Ok(RegistrationReply {
            status: 401,
            token: None,
        }));

        let err = run_with(
            &Options::default(),
            &config(),
            TokenStore::new(dir.path().join("jwt")),
            &scanner,
            &ingress,
            never(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            RunError::Credential(CredentialError::Rejected(401))
        ));
        assert!(!scanner.started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_stops_an_open_scan() {
        let dir = tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("jwt"));
        store.save(&Credential::new("stored")).unwrap();

        let scanner = FakeScanner::open(vec![matching_advertisement(sample_payload())]);
        let ingress = FakeIngress::new();

        let shutdown = tokio::time::sleep(Duration::from_millis(50));
        run_with(&Options::default(), &config(), store, &scanner, &ingress, shutdown)
            .await
            .unwrap();

        assert_eq!(ingress.event_count(), 2);
    }

    #[tokio::test]
    async fn closed_scanner_stream_is_an_error() {
        let dir = tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("jwt"));
        store.save(&Credential::new("stored")).unwrap();

        let scanner = FakeScanner::new(vec![matching_advertisement(sample_payload())]);
        let ingress = FakeIngress::new();

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            run_with(&Options::default(), &config(), store, &scanner, &ingress, never()),
        )
        .await
        .expect("run_with should return once the stream closes")
        .unwrap_err();

        assert!(matches!(err, RunError::Scan(ScanError::Stopped)));
        // Advertisements received before the stream closed are still delivered
        assert_eq!(ingress.event_count(), 2);
    }

    #[tokio::test]
    async fn run_reports_missing_config() {
        let dir = tempdir().unwrap();
        let options = Options {
            config: Some(dir.path().join("missing.json")),
            token_file: Some(dir.path().join("jwt")),
            ..Options::default()
        };

        let err = run(options, never()).await.unwrap_err();
        assert!(matches!(err, RunError::Config(ConfigError::Read { .. })));
    }

    #[test]
    fn options_parse_flags() {
        let options = Options::try_parse_from([
            "sense-ble-gateway",
            "--force-register",
            "--config",
            "/tmp/conf.json",
            "--request-timeout",
            "500ms",
        ])
        .unwrap();
        assert!(options.force_register);
        assert_eq!(options.config, Some(PathBuf::from("/tmp/conf.json")));
        assert_eq!(options.request_timeout, Duration::from_millis(500));
        assert!(!options.verbose);
    }

    #[test]
    fn options_defaults() {
        let options = Options::try_parse_from(["sense-ble-gateway"]).unwrap();
        assert!(!options.force_register);
        assert_eq!(options.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(options.backend, Backend::default());
    }
}
