mod camera;
use camera::SyntheticCamera;

mod protocol;
use protocol::fragment;

mod session;
use session::{ControlSession, SessionConfig};

mod stream;
use stream::StreamConfig;

use std::{net::SocketAddr, sync::Arc};

use clap::builder::TypedValueParser;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(
        long,
        short,
        env = "DETECTOR_CONTROLLER_URL",
        help = "Controller WebSocket endpoint",
        default_value = "wss://localhost:9696/api/v1/detectors/controller"
    )]
    controller: String,

    #[arg(
        long,
        short,
        env = "DETECTOR_IDENTITY",
        help = "Identity sent to the controller on registration",
        default_value = "121212121212"
    )]
    identity: String,

    #[arg(long, help = "Accept invalid or self-signed controller certificates")]
    insecure: bool,

    #[arg(
        long,
        short = 'd',
        help = "Destination for streamed fragments",
        default_value = "127.0.0.1:9697"
    )]
    stream_dest: SocketAddr,

    #[arg(
        long,
        help = "Maximum image bytes per fragment",
        default_value_t = fragment::STRIDE,
        value_parser = clap::value_parser!(u16).range(1..=65503).map(usize::from)
    )]
    stride: usize,

    #[arg(
        long,
        short,
        help = "JPEG quality of streamed frames",
        default_value_t = 60,
        value_parser = clap::value_parser!(u8).range(1..=100)
    )]
    quality: u8,

    #[arg(long, help = "Camera frame width", default_value_t = 640)]
    width: u32,

    #[arg(long, help = "Camera frame height", default_value_t = 480)]
    height: u32,

    #[arg(
        long,
        short,
        help = "Camera frame rate",
        default_value_t = 10,
        value_parser = clap::value_parser!(u32).range(1..=120)
    )]
    fps: u32,

    #[arg(long, help = "Count and log failed fragment sends")]
    report_send_errors: bool,

    #[arg(long, help = "Honor a new detector id sent mid-session")]
    follow_reassignment: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configure logging to stdout via `tracing`
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let camera = Arc::new(SyntheticCamera::new(args.width, args.height, args.fps));
    let config = SessionConfig {
        identity: args.identity,
        follow_reassignment: args.follow_reassignment,
    };
    let stream = StreamConfig {
        dest: args.stream_dest,
        stride: args.stride,
        quality: args.quality,
        report_send_errors: args.report_send_errors,
    };

    if args.insecure {
        warn!("controller certificate verification is disabled");
    }
    let ws = session::connect(&args.controller, args.insecure).await?;
    let session = ControlSession::register(ws, &config, camera, stream).await?;
    info!(
        "detector {} streaming to {} on request",
        session.detector_id(),
        args.stream_dest
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        }
    });

    session.run(shutdown).await?;

    Ok(())
}
