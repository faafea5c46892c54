use std::path::PathBuf;

use crate::config::PatcherConfig;

const UNBUFFERED_ENV: (&str, &str) = ("PYTHONUNBUFFERED", "true");
const TMPDIR_ENV: &str = "TMPDIR";
const AUTO_BOOT_IMAGE: &str = "auto";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    /// Explicit environment. `None` inherits the parent's environment.
    pub env: Option<Vec<(String, String)>>,
    pub cwd: PathBuf,
    /// Log stdout lines as they arrive. Stderr is always logged.
    pub log_stdout: bool,
}

impl CommandSpec {
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.argv.iter().any(|a| a == arg)
    }

    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        self.argv
            .iter()
            .position(|a| a == flag)
            .and_then(|idx| self.argv.get(idx + 1))
            .map(String::as_str)
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .as_ref()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvocationRequest {
    PatchFile(PatchFileRequest),
    CheckSupport(SupportCheckRequest),
    UpdateDaemon { boot_image: String },
    QueryMetadata,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchFileRequest {
    pub filename: String,
    pub device: String,
    pub partconfig: String,
    /// Present only when the file is not natively supported by the patcher.
    pub unsupported: Option<UnsupportedOptions>,
}

impl PatchFileRequest {
    pub fn supported(
        filename: impl Into<String>,
        device: impl Into<String>,
        partconfig: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            device: device.into(),
            partconfig: partconfig.into(),
            unsupported: None,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.unsupported.is_none()
    }

    /// Name of the file the patcher writes: `rom.zip` patched for `dual` becomes
    /// `rom_dual.zip`.
    pub fn new_file_name(&self) -> String {
        new_file_name(&self.filename, &self.partconfig)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnsupportedOptions {
    pub selection: PatchSelection,
    pub device_check: bool,
}

/// A preset replaces manual autopatcher/patch selection entirely, boot image
/// handling included.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatchSelection {
    Preset(String),
    Manual {
        autopatcher: Option<String>,
        patch: Option<String>,
        boot_image: BootImageSpec,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootImageSpec {
    NoBootImage,
    Present {
        /// `None` lets the patcher locate the image itself.
        boot_image: Option<String>,
        ramdisk: String,
        patched_init: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupportCheckRequest {
    pub filename: String,
    pub device: String,
    pub partconfig: String,
}

#[derive(Clone, Debug)]
pub struct CommandSpecBuilder {
    interpreter: String,
    no_bytecode_flag: String,
    patch_script: String,
    metadata_script: String,
    daemon_update_script: String,
    install_dir: PathBuf,
    cache_dir: PathBuf,
}

impl CommandSpecBuilder {
    pub fn new(config: &PatcherConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            no_bytecode_flag: config.no_bytecode_flag.clone(),
            patch_script: config.patch_script.clone(),
            metadata_script: config.metadata_script.clone(),
            daemon_update_script: config.daemon_update_script.clone(),
            install_dir: config.install_dir(),
            cache_dir: config.cache_dir.clone(),
        }
    }

    pub fn build(&self, request: &InvocationRequest) -> CommandSpec {
        match request {
            InvocationRequest::PatchFile(req) => self.patch_file(req),
            InvocationRequest::CheckSupport(req) => self.check_support(req),
            InvocationRequest::UpdateDaemon { boot_image } => self.update_daemon(boot_image),
            InvocationRequest::QueryMetadata => self.query_metadata(),
        }
    }

    fn patch_file(&self, req: &PatchFileRequest) -> CommandSpec {
        let mut argv = self.script_argv(&self.patch_script);
        argv.push("--noquestions".into());
        push_target(&mut argv, &req.filename, &req.device, &req.partconfig);

        if let Some(opts) = req.unsupported.as_ref() {
            argv.push("--unsupported".into());
            match &opts.selection {
                PatchSelection::Preset(path) => push_pair(&mut argv, "--preset", path),
                PatchSelection::Manual {
                    autopatcher,
                    patch,
                    boot_image,
                } => {
                    if let Some(autopatcher) = autopatcher {
                        push_pair(&mut argv, "--autopatcher", autopatcher);
                    }
                    if let Some(patch) = patch {
                        push_pair(&mut argv, "--patch", patch);
                    }
                    push_boot_image(&mut argv, boot_image);
                }
            }
            if !opts.device_check {
                argv.push("--nodevicecheck".into());
            }
        }

        let mut env = base_env();
        env.push((
            TMPDIR_ENV.to_string(),
            self.cache_dir.to_string_lossy().into_owned(),
        ));
        self.spec(argv, env, true)
    }

    fn check_support(&self, req: &SupportCheckRequest) -> CommandSpec {
        let mut argv = self.script_argv(&self.patch_script);
        argv.push("--is-supported".into());
        push_target(&mut argv, &req.filename, &req.device, &req.partconfig);
        self.spec(argv, base_env(), true)
    }

    fn query_metadata(&self) -> CommandSpec {
        let argv = self.script_argv(&self.metadata_script);
        self.spec(argv, base_env(), false)
    }

    fn update_daemon(&self, boot_image: &str) -> CommandSpec {
        let mut argv = self.script_argv(&self.daemon_update_script);
        argv.push(boot_image.to_string());
        self.spec(argv, base_env(), true)
    }

    fn script_argv(&self, script: &str) -> Vec<String> {
        vec![
            self.interpreter.clone(),
            self.no_bytecode_flag.clone(),
            script.to_string(),
        ]
    }

    fn spec(&self, argv: Vec<String>, env: Vec<(String, String)>, log_stdout: bool) -> CommandSpec {
        CommandSpec {
            argv,
            env: Some(env),
            cwd: self.install_dir.clone(),
            log_stdout,
        }
    }
}

// TODO: derive names for .img and .lok inputs once the patcher reports its output path.
pub fn new_file_name(filename: &str, partconfig: &str) -> String {
    filename.replace(".zip", &format!("_{partconfig}.zip"))
}

fn base_env() -> Vec<(String, String)> {
    vec![(UNBUFFERED_ENV.0.to_string(), UNBUFFERED_ENV.1.to_string())]
}

fn push_pair(argv: &mut Vec<String>, flag: &str, value: &str) {
    argv.push(flag.to_string());
    argv.push(value.to_string());
}

fn push_target(argv: &mut Vec<String>, filename: &str, device: &str, partconfig: &str) {
    argv.push(filename.to_string());
    push_pair(argv, "--device", device);
    push_pair(argv, "--partconfig", partconfig);
}

fn push_boot_image(argv: &mut Vec<String>, boot_image: &BootImageSpec) {
    match boot_image {
        BootImageSpec::NoBootImage => argv.push("--nobootimage".into()),
        BootImageSpec::Present {
            boot_image,
            ramdisk,
            patched_init,
        } => {
            argv.push("--hasbootimage".into());
            push_pair(
                argv,
                "--bootimage",
                boot_image.as_deref().unwrap_or(AUTO_BOOT_IMAGE),
            );
            push_pair(argv, "--ramdisk", ramdisk);
            if let Some(init) = patched_init {
                push_pair(argv, "--patchedinit", init);
            }
        }
    }
}
