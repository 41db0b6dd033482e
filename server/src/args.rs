//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "PipiTrek telescope autoguider and mount-control server")]
pub struct Args {
    /// Serial device of the mount controller.
    #[arg(long, default_value = "/dev/ttyUSB0")]
    pub serial_device: String,

    /// Run without a mount (camera and analyzer only).
    #[arg(long)]
    pub no_mount: bool,

    /// V4L2 device of the guide camera.
    #[arg(long, default_value = "/dev/video0")]
    pub camera_device: String,

    /// Run without a camera (mount control only).
    #[arg(long)]
    pub no_camera: bool,

    /// HTTP/WebSocket listen address.
    #[arg(long, default_value = "0.0.0.0:8443")]
    pub http_addr: String,

    /// TLS certificate in PEM format; plain HTTP when omitted.
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key in PEM format.
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Listen address of the raw TCP mount channel.
    #[arg(long, default_value = "0.0.0.0:5123")]
    pub telescope_addr: String,

    /// Listen address of the Stellarium protocol server.
    #[arg(long, default_value = "0.0.0.0:10000")]
    pub stellarium_addr: String,

    /// Settings file.
    #[arg(long, default_value = "settings.json")]
    pub settings: PathBuf,

    /// Directory for logs, frames, masks and dark frames.
    #[arg(long, default_value = ".")]
    pub data_dir: PathBuf,

    /// External firmware flashing command; the hex path is appended.
    #[arg(long, default_value = "avrdude")]
    pub flasher: String,

    /// Additional arguments for the firmware flasher.
    #[arg(long)]
    pub flasher_arg: Vec<String>,

    /// Bluetooth serial device for the HC-05 side channel.
    #[cfg(feature = "bluetooth")]
    #[arg(long, default_value = "/dev/ttyAML1")]
    pub bt_device: String,
}
