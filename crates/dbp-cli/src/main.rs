use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use dbp_patcher::{
    BootImageSpec, CommandListener, OutputStream, PatchFileRequest, PatchSelection,
    PatcherConfig, PatcherRuntime, SupportCheckRequest, UnsupportedOptions,
};
use tokio::sync::watch;
use tracing::warn;

#[derive(Parser)]
#[command(name = "dbp-cli", version, about = "Drive the bundled dual boot patcher")]
struct Cli {
    /// Application version the toolchain archive is named after
    #[arg(long, global = true)]
    app_version: Option<String>,
    /// Directory holding the bundled toolchain archive
    #[arg(long, global = true)]
    assets_dir: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Extract the toolchain if needed
    Extract,
    /// Show where the toolchain lives and whether it is extracted
    Status,
    /// Print patcher metadata
    Info {
        /// Also write the metadata as JSON to this path
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Check whether a file can be patched without manual options
    IsSupported {
        file: String,
        #[arg(long)]
        device: String,
        #[arg(long)]
        partconfig: String,
    },
    /// Patch a file for a partition configuration
    PatchFile(PatchFileArgs),
    /// Update the sync daemon inside a boot image
    UpdateSyncdaemon { boot_image: String },
}

#[derive(Args)]
struct PatchFileArgs {
    file: String,
    #[arg(long)]
    device: String,
    #[arg(long)]
    partconfig: String,
    /// The file is not natively supported; patch it with the options below
    #[arg(long)]
    unsupported: bool,
    #[arg(long, requires = "unsupported", conflicts_with_all = ["autopatcher", "patch", "no_boot_image", "boot_image", "ramdisk", "patched_init"])]
    preset: Option<String>,
    #[arg(long, requires = "unsupported")]
    autopatcher: Option<String>,
    #[arg(long, requires = "unsupported")]
    patch: Option<String>,
    #[arg(long, requires = "unsupported", conflicts_with_all = ["boot_image", "ramdisk", "patched_init"])]
    no_boot_image: bool,
    /// Boot image path inside the file; located automatically when omitted
    #[arg(long, requires = "unsupported")]
    boot_image: Option<String>,
    #[arg(long, requires = "unsupported")]
    ramdisk: Option<String>,
    #[arg(long, requires = "unsupported")]
    patched_init: Option<String>,
    #[arg(long, requires = "unsupported")]
    no_device_check: bool,
}

impl PatchFileArgs {
    fn into_request(self) -> Result<PatchFileRequest, String> {
        let mut request = PatchFileRequest::supported(self.file, self.device, self.partconfig);
        if !self.unsupported {
            return Ok(request);
        }

        let selection = match self.preset {
            Some(preset) => PatchSelection::Preset(preset),
            None => {
                let boot_image = if self.no_boot_image {
                    BootImageSpec::NoBootImage
                } else {
                    let ramdisk = self
                        .ramdisk
                        .ok_or("--ramdisk is required unless --no-boot-image or --preset is given")?;
                    BootImageSpec::Present {
                        boot_image: self.boot_image,
                        ramdisk,
                        patched_init: self.patched_init,
                    }
                };
                PatchSelection::Manual {
                    autopatcher: self.autopatcher,
                    patch: self.patch,
                    boot_image,
                }
            }
        };
        request.unsupported = Some(UnsupportedOptions {
            selection,
            device_check: !self.no_device_check,
        });
        Ok(request)
    }
}

struct PrintListener;

impl CommandListener for PrintListener {
    fn on_new_output_line(&mut self, line: &str, stream: OutputStream) {
        println!("[{stream}] {line}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dbp_util::init_tracing()?;
    let cli = Cli::parse();

    let mut config = PatcherConfig::load();
    if let Some(version) = cli.app_version {
        config.app_version = version;
    }
    if let Some(dir) = cli.assets_dir {
        config.assets_dir = dir;
    }
    let runtime = PatcherRuntime::with_defaults(config);
    let cancel_rx = spawn_ctrl_c_watcher();
    let cancel = Some(&cancel_rx);

    match cli.cmd {
        Cmd::Extract => {
            let installation = runtime.ensure_installed(cancel).await?;
            println!("install_dir={}", installation.install_dir.display());
        }
        Cmd::Status => {
            let installation = runtime.probe_installation();
            println!("install_dir={}", installation.install_dir.display());
            println!("archive={}", installation.archive_file.display());
            println!("present={}", installation.present);
            if let Some(prov) = installation.provenance() {
                println!("version={}", prov.version);
                println!("sha256={}", prov.sha256);
                println!("installed_at_unix_millis={}", prov.installed_at_unix_millis);
            }
        }
        Cmd::Info { export } => {
            let info = runtime.patcher_info(cancel).await?;
            println!("version={}", info.version);
            for device in &info.devices {
                println!("device\t{}\t{}", device.codename, device.name);
            }
            for partconfig in &info.partconfigs {
                println!("partconfig\t{}\t{}", partconfig.id, partconfig.name);
            }
            for preset in &info.patchinfos {
                println!("preset\t{}\t{}", preset.path, preset.name);
            }
            if let Some(path) = export {
                dbp_util::write_json_atomic(&path, info.as_ref())?;
                println!("exported={}", path.display());
            }
        }
        Cmd::IsSupported {
            file,
            device,
            partconfig,
        } => {
            let request = SupportCheckRequest {
                filename: file,
                device,
                partconfig,
            };
            let supported = runtime.is_file_supported(&request, cancel).await?;
            println!("supported={supported}");
        }
        Cmd::PatchFile(args) => {
            let request = args.into_request()?;
            let mut listener = PrintListener;
            let result = runtime.patch_file(&request, &mut listener, cancel).await?;
            println!("new_file={}", result.new_file_name);
            println!("message={}", result.message);
            println!("failed={}", result.failed);
            if result.failed {
                std::process::exit(1);
            }
        }
        Cmd::UpdateSyncdaemon { boot_image } => {
            let updated = runtime.update_syncdaemon(&boot_image, cancel).await?;
            println!("updated={updated}");
            if !updated {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn spawn_ctrl_c_watcher() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(true);
            }
            Err(err) => warn!("Failed to listen for Ctrl-C: {err}"),
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("dbp-cli").chain(args.iter().copied()))
    }

    fn patch_request(args: &[&str]) -> PatchFileRequest {
        match parse(args).unwrap().cmd {
            Cmd::PatchFile(args) => args.into_request().unwrap(),
            _ => panic!("expected patch-file"),
        }
    }

    #[test]
    fn supported_patch_has_no_options() {
        let request = patch_request(&[
            "patch-file", "rom.zip", "--device", "hammerhead", "--partconfig", "dual",
        ]);
        assert!(request.is_supported());
    }

    #[test]
    fn manual_options_map_to_request() {
        let request = patch_request(&[
            "patch-file",
            "rom.zip",
            "--device",
            "hammerhead",
            "--partconfig",
            "dual",
            "--unsupported",
            "--autopatcher",
            "Standard",
            "--ramdisk",
            "hammerhead/AOSP/AOSP",
            "--no-device-check",
        ]);
        let opts = request.unsupported.unwrap();
        assert!(!opts.device_check);
        assert_eq!(
            opts.selection,
            PatchSelection::Manual {
                autopatcher: Some("Standard".into()),
                patch: None,
                boot_image: BootImageSpec::Present {
                    boot_image: None,
                    ramdisk: "hammerhead/AOSP/AOSP".into(),
                    patched_init: None,
                },
            }
        );
    }

    #[test]
    fn preset_conflicts_with_manual_options() {
        assert!(parse(&[
            "patch-file",
            "rom.zip",
            "--device",
            "d",
            "--partconfig",
            "dual",
            "--unsupported",
            "--preset",
            "p.py",
            "--autopatcher",
            "Standard",
        ])
        .is_err());
    }

    #[test]
    fn manual_options_need_unsupported() {
        assert!(parse(&[
            "patch-file", "rom.zip", "--device", "d", "--partconfig", "dual", "--preset", "p.py",
        ])
        .is_err());
    }

    #[test]
    fn boot_image_needs_ramdisk() {
        let cli = parse(&[
            "patch-file",
            "rom.zip",
            "--device",
            "d",
            "--partconfig",
            "dual",
            "--unsupported",
        ])
        .unwrap();
        match cli.cmd {
            Cmd::PatchFile(args) => assert!(args.into_request().is_err()),
            _ => panic!("expected patch-file"),
        }
    }
}
