//! Shared test infrastructure for integration tests.
//!
//! Each `JobFixture` owns a scratch job root, a local input directory, an
//! object store root, and a private `bin/` of fake stage programs that is
//! put first on `PATH` when `caldp` runs.
#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

pub const ACS_DATASET: &str = "J8CB010B0";

/// Copies each argument to `<stem>_<suffix>.fits`, then exits with
/// `$<status_var>` (default 0).
fn fake_stage(suffix: &str, status_var: &str) -> String {
    format!(
        "#!/bin/sh\nfor f in \"$@\"; do\n  stem=\"${{f%_*}}\"\n  cp \"$f\" \"${{stem}}_{suffix}.fits\"\ndone\necho \"processed $#\"\nexit \"${{{status_var}:-0}}\"\n"
    )
}

const FAKE_MOSAIC: &str = "#!/bin/sh\necho \"mosaic from $1\"\nexit 0\n";

pub struct JobFixture {
    _dir: TempDir,
    pub root: PathBuf,
    pub inputs: PathBuf,
    pub buckets: PathBuf,
    bin: PathBuf,
    env: Vec<(String, String)>,
}

impl JobFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("job");
        let inputs = dir.path().join("incoming");
        let buckets = dir.path().join("buckets");
        let bin = dir.path().join("bin");
        for path in [&root, &inputs, &buckets, &bin] {
            fs::create_dir_all(path).expect("mkdir");
        }
        let fixture = Self {
            _dir: dir,
            root,
            inputs,
            buckets,
            bin,
            env: Vec::new(),
        };
        fixture.install("calacs.e", &fake_stage("flt", "FAKE_STAGE1_STATUS"));
        fixture.install("runastrodriz", &fake_stage("drz", "FAKE_STAGE2_STATUS"));
        fixture.install("runsinglehap", FAKE_MOSAIC);
        fixture.install("runmultihap", FAKE_MOSAIC);
        fixture
    }

    fn install(&self, name: &str, script: &str) {
        let path = self.bin.join(name);
        fs::write(&path, script).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// An association with two members, laid out as a local input dir.
    pub fn seed_acs_association(&self) {
        for name in ["j8cb010b0_asn.fits", "j8cb01u3q_raw.fits", "j8cb01u8q_raw.fits"] {
            write_fits(&self.inputs.join(name));
        }
    }

    /// A single-visit mosaic: a poller file plus the calibrated exposures
    /// it names.
    pub fn seed_mosaic(&self, dataset: &str) {
        let names = ["ib4606c5q_flc.fits", "ib4606c6q_flc.fits"];
        for name in names {
            write_fits(&self.inputs.join(name));
        }
        let poller = names
            .iter()
            .map(|name| format!("{name},11788,A46,06,1.0,F555W,UVIS,{name}"))
            .collect::<Vec<_>>()
            .join("\n");
        fs::write(self.inputs.join(format!("{dataset}_input.out")), poller)
            .expect("write poller");
    }

    pub fn local_input(&self) -> String {
        format!("file:{}", self.inputs.display())
    }

    pub fn marker_names(&self) -> Vec<String> {
        let dir = self.root.join("messages");
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn transcript(&self) -> String {
        fs::read_to_string(self.root.join("process.txt")).unwrap_or_default()
    }

    /// Run `caldp` with `args` against this fixture's job root.
    pub fn run(&self, args: &[&str]) -> Output {
        let path = match std::env::var("PATH") {
            Ok(path) => format!("{}:{path}", self.bin.display()),
            Err(_) => self.bin.display().to_string(),
        };
        let mut command = Command::new(env!("CARGO_BIN_EXE_caldp"));
        command
            .arg("--work-dir")
            .arg(&self.root)
            .args(args)
            .env_clear()
            .env("PATH", path)
            .env("RUST_LOG", "warn")
            .env("CALDP_BESTREFS_COMMAND", "true")
            .env("CALDP_OBJECT_STORE_ROOT", &self.buckets)
            .env("CALDP_RETRIEVE_URL", "http://127.0.0.1:9/unreachable")
            .env("CALDP_PRODUCT_LIST_URL", "http://127.0.0.1:9/list?dataset=")
            .env("CALDP_RETRY_ATTEMPTS", "1")
            .env("CALDP_RETRY_MIN_SECONDS", "0")
            .env("CALDP_RETRY_MAX_SECONDS", "0");
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command.output().expect("run caldp")
    }
}

/// Minimal primary-header-only FITS file.
pub fn write_fits(path: &Path) {
    let mut header = String::new();
    for (keyword, value) in [("SIMPLE", "T"), ("BITPIX", "8"), ("NAXIS", "0")] {
        header.push_str(&format!("{keyword:<8}= {value:>20}{:50}", ""));
    }
    header.push_str(&format!("{:<80}", "END"));
    while header.len() % 2880 != 0 {
        header.push(' ');
    }
    fs::write(path, header).expect("write fits");
}

pub fn exit_code(output: &Output) -> i32 {
    output.status.code().expect("caldp exited by signal")
}
