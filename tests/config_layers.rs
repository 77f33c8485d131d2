//! Layered configuration loading through the real file, environment and CLI
//! sources. These tests mutate process environment and run serially.

use std::io::Write;

use clap::Parser;
use prerender_cache::cache::BackendConfig;
use prerender_cache::config::{self, CliArgs};
use serial_test::serial;

const TOUCHED_VARS: &[&str] = &[
    "PRERENDER_CACHE__CACHE__TTL_MS",
    "PRERENDER_CACHE__SERVER__PORT",
    "PRERENDER_CACHE__CACHE__BACKEND",
    "PRERENDER_CACHE_CONFIG_FILE",
    "S3_BUCKET_NAME",
    "S3_PREFIX_KEY",
    "AWS_REGION",
];

struct EnvGuard;

impl EnvGuard {
    fn set(pairs: &[(&str, &str)]) -> Self {
        clear();
        for (name, value) in pairs {
            // SAFETY: every test in this file is `#[serial]`, so no other
            // thread reads the environment concurrently.
            unsafe { std::env::set_var(name, value) };
        }
        Self
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        clear();
    }
}

fn clear() {
    for name in TOUCHED_VARS {
        // SAFETY: see `EnvGuard::set`.
        unsafe { std::env::remove_var(name) };
    }
}

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

fn cli(args: &[&str]) -> CliArgs {
    CliArgs::try_parse_from(std::iter::once("prerender-cache").chain(args.iter().copied()))
        .expect("arguments should parse")
}

#[test]
#[serial]
fn environment_overrides_file_and_cli_overrides_environment() {
    let file = config_file(
        r#"
[server]
port = 4000

[cache]
ttl_ms = 1000
min_html_length = 500
"#,
    );
    let _env = EnvGuard::set(&[
        ("PRERENDER_CACHE__CACHE__TTL_MS", "2000"),
        ("PRERENDER_CACHE__SERVER__PORT", "4100"),
    ]);

    let path = file.path().to_str().expect("utf-8 path");
    let settings = config::load(&cli(&[
        "--config-file",
        path,
        "serve",
        "--server-port",
        "4200",
    ]))
    .expect("settings load");

    assert_eq!(settings.server.addr.port(), 4200);
    assert_eq!(settings.cache.ttl_ms.get(), 2000);
    assert_eq!(settings.cache.min_html_length, 500);
}

#[test]
#[serial]
fn camel_case_file_keys_are_accepted() {
    let file = config_file(
        r#"
[cache]
cache = "disk"
baseDir = "/var/cache/pages"
ttl = 600000
"#,
    );
    let _env = EnvGuard::set(&[]);

    let path = file.path().to_str().expect("utf-8 path");
    let settings = config::load(&cli(&["--config-file", path])).expect("settings load");

    assert_eq!(settings.cache.ttl_ms.get(), 600_000);
    assert_eq!(
        settings.cache.backend,
        BackendConfig::Disk {
            base_dir: "/var/cache/pages".into()
        }
    );
}

#[test]
#[serial]
fn object_store_reads_conventional_environment() {
    let _env = EnvGuard::set(&[
        ("PRERENDER_CACHE__CACHE__BACKEND", "s3"),
        ("S3_BUCKET_NAME", "rendered-pages"),
        ("S3_PREFIX_KEY", "snapshots"),
        ("AWS_REGION", "eu-west-1"),
    ]);

    let settings = config::load(&cli(&[])).expect("settings load");

    match settings.cache.backend {
        BackendConfig::ObjectStore(store) => {
            assert_eq!(store.bucket, "rendered-pages");
            assert_eq!(store.prefix, "snapshots");
            assert_eq!(store.region.as_deref(), Some("eu-west-1"));
        }
        other => panic!("expected object store, got {other:?}"),
    }
}

#[test]
#[serial]
fn missing_explicit_config_file_is_an_error() {
    let _env = EnvGuard::set(&[]);

    let result = config::load(&cli(&["--config-file", "/nonexistent/prerender-cache.toml"]));
    assert!(result.is_err());
}
