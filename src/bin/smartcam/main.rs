//! Smartcam recorder
//!
//! Records during bookings and uploads every finished recording.
//!
//! Usage:
//!   SUPABASE_URL=... SUPABASE_SERVICE_KEY=... SMARTCAM_USER_ID=... smartcam
//!   smartcam --probe         # find a camera, print it, exit
//!   smartcam --test-source   # synthetic camera (requires the test-source feature)

use anyhow::{Context, Result};
use smartcam::capture::{self, CameraConfig};
use smartcam::recorder::run_watchdog;
use smartcam::remote::{BookingSource, MetadataStore, ObjectStore};
use smartcam::{
    ArtifactStore, CameraDevice, RecorderConfig, RecordingController, SchedulerConfig,
    SchedulerLoop, StoreConfig, SupabaseClient, SupabaseConfig, UploadConfig, UploadWorker,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// How long shutdown waits for tasks to finish
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Status log interval
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Recorder configuration from environment/args
struct Config {
    /// Supabase connection, absent only in test-source mode
    supabase: Option<SupabaseConfig>,
    user_id: String,
    camera: CameraConfig,
    store: StoreConfig,
    recorder: RecorderConfig,
    scheduler: SchedulerConfig,
    upload: UploadConfig,
    /// Use the synthetic camera instead of real hardware
    test_source: bool,
    /// Probe the camera and exit
    probe_only: bool,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    fn from_env() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let test_source = args.iter().any(|arg| arg == "--test-source");
        let probe_only = args.iter().any(|arg| arg == "--probe");

        let data_dir = std::env::var("SMARTCAM_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/smartcam"));

        let recording_dir = std::env::var("SMARTCAM_RECORDING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("recordings"));

        let user_id = std::env::var("SMARTCAM_USER_ID").unwrap_or_default();

        let supabase = match std::env::var("SUPABASE_URL") {
            Ok(url) => {
                let service_key = std::env::var("SUPABASE_SERVICE_KEY")
                    .or_else(|_| std::env::var("SUPABASE_SERVICE_ROLE_KEY"))
                    .context("SUPABASE_SERVICE_KEY environment variable not set")?;
                anyhow::ensure!(!user_id.is_empty(), "SMARTCAM_USER_ID environment variable not set");
                Some(SupabaseConfig {
                    url,
                    service_key,
                    user_id: user_id.clone(),
                    ..Default::default()
                })
            }
            Err(_) if test_source || probe_only => None,
            Err(_) => anyhow::bail!("SUPABASE_URL environment variable not set"),
        };

        let defaults = CameraConfig::default();
        let camera = CameraConfig {
            record_width: env_or("SMARTCAM_RECORD_WIDTH", defaults.record_width),
            record_height: env_or("SMARTCAM_RECORD_HEIGHT", defaults.record_height),
            record_fps: env_or("SMARTCAM_RECORD_FPS", defaults.record_fps),
            preview_width: env_or("SMARTCAM_PREVIEW_WIDTH", defaults.preview_width),
            preview_height: env_or("SMARTCAM_PREVIEW_HEIGHT", defaults.preview_height),
            preview_fps: env_or("SMARTCAM_PREVIEW_FPS", defaults.preview_fps),
            output_dir: recording_dir,
            device_override: std::env::var("SMARTCAM_CAMERA_DEVICE").ok(),
            ..defaults
        };

        let recorder = RecorderConfig {
            max_duration: Duration::from_secs(env_or("SMARTCAM_MAX_RECORDING_SECS", 2 * 60 * 60)),
            recovery: camera.finalize_settings(Some(camera.record_fps)),
            ..Default::default()
        };

        let scheduler = SchedulerConfig {
            poll_interval: Duration::from_secs(env_or("SMARTCAM_POLL_SECS", 10)),
            stale_grace: Duration::from_secs(env_or("SMARTCAM_STALE_GRACE_SECS", 10 * 60)),
            ..Default::default()
        };

        let upload = UploadConfig {
            user_id: user_id.clone(),
            max_backoff: Duration::from_secs(env_or("SMARTCAM_UPLOAD_MAX_BACKOFF_SECS", 5 * 60)),
            ..Default::default()
        };

        Ok(Self {
            supabase,
            user_id,
            camera,
            store: StoreConfig { root_path: data_dir },
            recorder,
            scheduler,
            upload,
            test_source,
            probe_only,
        })
    }
}

/// The three remote collaborators
struct Remotes {
    bookings: Arc<dyn BookingSource>,
    objects: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
}

fn remotes(config: &Config) -> Result<Remotes> {
    if let Some(supabase) = &config.supabase {
        let client = Arc::new(
            SupabaseClient::new(supabase.clone()).context("Failed to build Supabase client")?,
        );
        return Ok(Remotes {
            bookings: client.clone(),
            objects: client.clone(),
            metadata: client,
        });
    }
    demo_remotes()
}

/// In-memory collaborators with one booking starting now
#[cfg(feature = "test-source")]
fn demo_remotes() -> Result<Remotes> {
    use smartcam::remote::{MemoryBookingSource, MemoryMetadataStore, MemoryObjectStore};
    use smartcam::Booking;

    let now = chrono::Local::now().naive_local();
    let end = now + chrono::Duration::minutes(2);
    let booking = Booking::new("demo", now.date(), now.time(), end.time());
    info!("No SUPABASE_URL, using in-memory services with a booking until {}", end.time());

    Ok(Remotes {
        bookings: Arc::new(MemoryBookingSource::new(vec![booking])),
        objects: Arc::new(MemoryObjectStore::new()),
        metadata: Arc::new(MemoryMetadataStore::new()),
    })
}

#[cfg(not(feature = "test-source"))]
fn demo_remotes() -> Result<Remotes> {
    anyhow::bail!("SUPABASE_URL environment variable not set")
}

async fn open_camera(config: &Config) -> Result<Box<dyn CameraDevice>> {
    if config.test_source {
        #[cfg(feature = "test-source")]
        {
            info!("Using synthetic test camera");
            return Ok(Box::new(smartcam::TestCamera::new(
                config.camera.clone(),
                smartcam::TestCameraConfig::default(),
            )));
        }
        #[cfg(not(feature = "test-source"))]
        {
            anyhow::bail!("--test-source requires building with the test-source feature");
        }
    }

    match capture::probe(&config.camera).await {
        Ok(camera) => Ok(camera),
        Err(e) => {
            error!("Camera probe failed: {}", e);
            Err(e).context("No usable camera; not starting the scheduler")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env()?;

    info!("Smartcam starting");
    info!(
        "  Record: {}x{} @ {}fps, preview {}x{} @ {}fps",
        config.camera.record_width,
        config.camera.record_height,
        config.camera.record_fps,
        config.camera.preview_width,
        config.camera.preview_height,
        config.camera.preview_fps
    );
    info!("  Recordings: {:?}", config.camera.output_dir);
    info!("  State: {:?}", config.store.root_path);
    info!("  User: {}", if config.user_id.is_empty() { "-" } else { config.user_id.as_str() });
    info!("  Poll: {:?}, max recording {:?}", config.scheduler.poll_interval, config.recorder.max_duration);
    info!("  Test source: {}", config.test_source);

    // A missing camera is fatal before anything else starts
    let mut camera = open_camera(&config).await?;

    if config.probe_only {
        info!("Camera backend: {}", camera.backend());
        tokio::time::sleep(Duration::from_millis(500)).await;
        match camera.capture_frame() {
            Some(frame) => info!("Preview frame: {}x{}, {} bytes", frame.width, frame.height, frame.jpeg.len()),
            None => warn!("No preview frame available"),
        }
        camera.release().await;
        return Ok(());
    }

    let store = Arc::new(ArtifactStore::open(config.store.clone()).context("Failed to open artifact store")?);
    let remotes = remotes(&config)?;

    let mut controller = RecordingController::new(camera, store.clone(), config.recorder.clone());
    controller
        .recover_orphans()
        .await
        .context("Failed to recover interrupted recordings")?;
    let status = controller.subscribe();
    let controller = controller.into_shared();

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    // Upload worker (restarted if it crashes)
    let worker = Arc::new(UploadWorker::new(
        config.upload.clone(),
        store.clone(),
        remotes.objects,
        remotes.metadata,
        remotes.bookings.clone(),
    ));
    tracker.spawn(worker.supervise(cancel.clone()));

    // Reconciliation and stale-booking sweep
    let scheduler = Arc::new(SchedulerLoop::new(
        config.scheduler.clone(),
        remotes.bookings,
        controller.clone(),
        store.clone(),
    ));
    tracker.spawn(scheduler.clone().run(cancel.clone()));
    tracker.spawn(scheduler.run_sweeper(cancel.clone()));

    // Duration cap and camera health
    tracker.spawn(run_watchdog(
        controller.clone(),
        config.recorder.watchdog_interval,
        cancel.clone(),
    ));

    // Status log
    {
        let cancel = cancel.clone();
        let store = store.clone();
        tracker.spawn(async move {
            let mut interval = tokio::time::interval(STATUS_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let current = status.borrow().clone();
                let free_mb = store.available_bytes().await.map(|b| b / (1024 * 1024));
                info!(
                    "Status: recording={} booking={} queued={} ({} MB) free={} MB",
                    current.is_recording,
                    current.booking_id.as_deref().unwrap_or("-"),
                    store.len().await,
                    store.pending_bytes().await / (1024 * 1024),
                    free_mb.map(|mb| mb.to_string()).unwrap_or_else(|| "?".to_string())
                );
            }
        });
    }

    tracker.close();

    wait_for_shutdown().await;
    info!("Received shutdown signal");
    cancel.cancel();

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, tracker.wait()).await.is_err() {
        warn!("Shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
    }

    controller.lock().await.release().await;
    info!("Smartcam stopped ({} upload(s) still queued)", store.len().await);
    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("smartcam=info".parse().unwrap()),
        )
        .init();
}

/// Resolve on SIGINT or SIGTERM
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for ctrl-c: {}", e);
    }
}
