use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tiltgate_core::angle::estimate_roll;
use tiltgate_core::detector::{ScrfdLandmarker, SCRFD_MODEL_FILE};
use tiltgate_core::{LandmarkDetector, TiltStatus};
use tiltgate_hw::{Camera, FrameSource};

#[zbus::proxy(
    interface = "io.tiltgate.Gesture1",
    default_service = "io.tiltgate.Gesture1",
    default_path = "/io/tiltgate/Gesture1"
)]
trait Gesture {
    async fn enable(&self) -> zbus::Result<()>;
    async fn disable(&self) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn enabled(&self) -> zbus::Result<bool>;

    #[zbus(signal)]
    fn tilt(&self, direction: &str, angle_degrees: i32) -> zbus::Result<()>;

    #[zbus(signal)]
    fn status_changed(&self, status: &str) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "tiltgate", about = "Head-tilt gesture control CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gesture pipeline and wait until it is running
    Enable,
    /// Stop the gesture pipeline and release the camera
    Disable,
    /// Show pipeline status
    Status,
    /// Print gestures as they happen (left = pass, right = match)
    Watch,
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics without the daemon
    Test {
        /// Number of frames to capture
        #[arg(short, long, default_value_t = 30)]
        frames: usize,
        /// Camera device path
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Directory holding det_10g.onnx; when set, print the roll angle per frame
        #[arg(short, long)]
        model_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enable => {
            let proxy = connect().await?;
            let mut changes = proxy.receive_status_changed().await?;
            proxy.enable().await?;
            println!("Starting pipeline...");

            let status = tokio::time::timeout(Duration::from_secs(15), async {
                let current = parse_status(&proxy.status().await?)?;
                if !current.loading {
                    return Ok(current);
                }
                while let Some(signal) = changes.next().await {
                    let status = parse_status(signal.args()?.status())?;
                    if !status.loading {
                        return Ok(status);
                    }
                }
                bail!("daemon went away while starting")
            })
            .await
            .context("timed out waiting for the pipeline to start")??;

            match status.error {
                Some(e) => bail!("pipeline failed to start: {e}"),
                None if status.active => println!("Pipeline running."),
                None => println!("Pipeline not running."),
            }
        }
        Commands::Disable => {
            let proxy = connect().await?;
            proxy.disable().await?;
            println!("Pipeline stopped; camera released.");
        }
        Commands::Status => {
            let proxy = connect().await?;
            let value: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Watch => {
            let proxy = connect().await?;
            if !proxy.enabled().await? {
                println!("Pipeline is not enabled; run `tiltgate enable` first.");
            }
            let mut tilts = proxy.receive_tilt().await?;
            let mut changes = proxy.receive_status_changed().await?;
            println!("Watching for head tilts (Ctrl-C to stop)...");

            loop {
                tokio::select! {
                    Some(signal) = tilts.next() => {
                        let args = signal.args()?;
                        let action = match *args.direction() {
                            "left" => "pass",
                            "right" => "match",
                            other => other,
                        };
                        println!("{action:<5}  tilt {} ({}°)", args.direction(), args.angle_degrees());
                    }
                    Some(signal) = changes.next() => {
                        let status = parse_status(signal.args()?.status())?;
                        if let Some(e) = status.error {
                            println!("pipeline error: {e}");
                        }
                    }
                    else => break,
                }
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found.");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Test {
            frames,
            device,
            model_dir,
        } => {
            println!("Running camera diagnostics on {device}...");
            tokio::task::spawn_blocking(move || run_diagnostics(&device, frames, model_dir.as_deref()))
                .await??;
        }
    }

    Ok(())
}

async fn connect() -> Result<GestureProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    tracing::debug!("connected to session bus");
    GestureProxy::new(&conn)
        .await
        .context("tiltgated is not reachable over D-Bus")
}

fn parse_status(json: &str) -> Result<TiltStatus> {
    serde_json::from_str(json).context("daemon sent malformed status")
}

/// Capture frames directly from the camera and report what the pipeline would see.
fn run_diagnostics(device: &str, frames: usize, model_dir: Option<&Path>) -> Result<()> {
    let camera = Camera::open(device, 320, 240)?;
    println!(
        "Opened {} at {}x{} ({:?})",
        camera.device_path,
        camera.width,
        camera.height,
        camera.pixel_format()
    );

    let mut landmarker = match model_dir {
        Some(dir) => {
            let path = dir.join(SCRFD_MODEL_FILE);
            Some(ScrfdLandmarker::load(&path.to_string_lossy())?)
        }
        None => None,
    };

    let mut stream = camera.into_stream()?;
    let started = Instant::now();
    let mut last_timestamp_ms = None;
    let (mut captured, mut dark) = (0usize, 0usize);

    for i in 0..frames {
        let Some(frame) = stream.wait_frame(Duration::from_secs(2))? else {
            println!("frame {i:>3}: timed out");
            continue;
        };
        captured += 1;
        if frame.is_dark {
            dark += 1;
        }

        let mut line = format!(
            "frame {i:>3}: seq={} {}x{} brightness={:.1}{}",
            frame.sequence,
            frame.width,
            frame.height,
            frame.avg_brightness(),
            if frame.is_dark { " dark" } else { "" }
        );

        if let Some(detector) = landmarker.as_mut().filter(|_| !frame.is_dark) {
            let mut timestamp_ms = frame.timestamp.duration_since(started).as_millis() as u64;
            if let Some(prev) = last_timestamp_ms {
                timestamp_ms = timestamp_ms.max(prev + 1);
            }
            last_timestamp_ms = Some(timestamp_ms);

            match detector.infer(&frame.data, frame.width, frame.height, timestamp_ms)? {
                Some(landmarks) => match estimate_roll(&landmarks) {
                    Some(roll) => line.push_str(&format!(" roll={roll:+.1}°")),
                    None => line.push_str(" face (no eyes)"),
                },
                None => line.push_str(" no face"),
            }
        }
        println!("{line}");
    }

    stream.release();
    if let Some(detector) = landmarker.as_mut() {
        detector.close();
    }

    println!("{captured}/{frames} frames captured, {dark} dark");
    if captured == 0 {
        bail!("camera produced no frames");
    }
    Ok(())
}
