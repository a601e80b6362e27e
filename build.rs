// build.rs

use clap::{Arg, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn build_cli() -> Command {
    Command::new("netbootd")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Netboot Contributors")
        .about("Network boot server for Flatcar with a verified artifact cache")
        .subcommand_required(false)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("Configuration file (TOML)"),
        )
        .arg(
            Arg::new("bind")
                .long("bind")
                .env("NETBOOT_HTTP_ADDR")
                .value_name("ADDR")
                .help("HTTP listen address"),
        )
        .arg(
            Arg::new("log_level")
                .long("log-level")
                .env("NETBOOT_LOG_LEVEL")
                .value_name("FILTER")
                .help("Log filter used when RUST_LOG is unset"),
        )
        .arg(
            Arg::new("data_dir")
                .long("data-dir")
                .env("NETBOOT_DATA_PATH")
                .value_name("PATH")
                .help("Directory for finalized artifacts"),
        )
        .arg(
            Arg::new("scratch_dir")
                .long("scratch-dir")
                .env("NETBOOT_CACHE_PATH")
                .value_name("PATH")
                .help("Directory for in-flight downloads"),
        )
        .subcommand(Command::new("serve").about("Serve boot scripts and artifacts (default)"))
        .subcommand(
            Command::new("prefetch")
                .about("Download and verify a release into the cache ahead of time")
                .arg(Arg::new("channel").required(true).help("Release channel (stable, beta, alpha)"))
                .arg(Arg::new("arch").required(true).help("Architecture (amd64, arm64 or a synonym)"))
                .arg(
                    Arg::new("version")
                        .default_value("current")
                        .help("Concrete version or \"current\""),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();

    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("netbootd.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
