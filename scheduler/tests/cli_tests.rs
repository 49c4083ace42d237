// End-to-end tests of the gitmirror binary and its subcommands

use base64::Engine;
use common::cipher::SecurityContext;
use std::path::Path;
use std::process::{Command, Output};
use std::time::{Duration, Instant};

fn gitmirror(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_gitmirror"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("failed to run gitmirror")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

#[test]
fn test_keygen_prints_a_32_byte_key() {
    let dir = tempfile::tempdir().unwrap();
    let output = gitmirror(dir.path(), &["keygen"]);
    assert!(output.status.success());

    let key = base64::engine::general_purpose::STANDARD
        .decode(stdout(&output))
        .unwrap();
    assert_eq!(key.len(), 32);
}

#[test]
fn test_encrypt_produces_a_decryptable_secret() {
    let dir = tempfile::tempdir().unwrap();
    let key = stdout(&gitmirror(dir.path(), &["keygen"]));

    let config = dir.path().join("gitmirror.toml");
    std::fs::write(&config, format!("encryption_key = \"{}\"\n", key)).unwrap();

    let output = gitmirror(
        dir.path(),
        &["-f", config.to_str().unwrap(), "encrypt", "hunter2"],
    );
    assert!(output.status.success(), "{:?}", output);

    let ciphertext = stdout(&output);
    assert_ne!(ciphertext, "hunter2");
    let security = SecurityContext::from_base64_key(&key).unwrap();
    assert_eq!(security.decrypt_secret(&ciphertext).unwrap(), "hunter2");
}

#[test]
fn test_encrypt_without_key_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("gitmirror.toml");
    std::fs::write(&config, "data_path = \"./data\"\n").unwrap();

    let output = gitmirror(dir.path(), &["-f", config.to_str().unwrap(), "encrypt", "x"]);
    assert!(!output.status.success());
}

#[test]
fn test_restore_from_local_storage() {
    let dir = tempfile::tempdir().unwrap();
    let key = stdout(&gitmirror(dir.path(), &["keygen"]));

    let root = dir.path().join("mirror");
    std::fs::create_dir_all(root.join("demo/src")).unwrap();
    std::fs::write(root.join("demo/README.md"), "# demo").unwrap();
    std::fs::write(root.join("demo/src/lib.rs"), "pub fn demo() {}").unwrap();

    let config = dir.path().join("gitmirror.toml");
    std::fs::write(
        &config,
        format!(
            "encryption_key = \"{}\"\n\n[[storages]]\ntype = \"local\"\nname = \"disk\"\nroot = \"{}\"\n",
            key,
            root.display()
        ),
    )
    .unwrap();

    let target = dir.path().join("restored");
    let output = gitmirror(
        dir.path(),
        &[
            "-f",
            config.to_str().unwrap(),
            "restore",
            "demo",
            "disk",
            target.to_str().unwrap(),
        ],
    );
    assert!(output.status.success(), "{:?}", output);
    assert_eq!(
        std::fs::read_to_string(target.join("src/lib.rs")).unwrap(),
        "pub fn demo() {}"
    );
    assert_eq!(std::fs::read_to_string(target.join("README.md")).unwrap(), "# demo");

    let output = gitmirror(
        dir.path(),
        &[
            "-f",
            config.to_str().unwrap(),
            "restore",
            "demo",
            "elsewhere",
            target.to_str().unwrap(),
        ],
    );
    assert!(!output.status.success());
}

#[test]
fn test_run_fails_fast_when_webhook_port_is_taken() {
    let dir = tempfile::tempdir().unwrap();
    let key = stdout(&gitmirror(dir.path(), &["keygen"]));
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let config = dir.path().join("gitmirror.toml");
    std::fs::write(
        &config,
        format!(
            "encryption_key = \"{}\"\n\n[webhook]\nenabled = true\nhost = \"127.0.0.1\"\nport = {}\n",
            key, port
        ),
    )
    .unwrap();

    let mut child = Command::new(env!("CARGO_BIN_EXE_gitmirror"))
        .current_dir(dir.path())
        .args(["-f", config.to_str().unwrap(), "run"])
        .spawn()
        .expect("failed to run gitmirror");

    let deadline = Instant::now() + Duration::from_secs(30);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if Instant::now() > deadline {
            child.kill().unwrap();
            panic!("gitmirror kept running without its webhook listener");
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    assert!(!status.success());
}
