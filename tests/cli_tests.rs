use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create an ipatlas command
fn ipatlas_cmd() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("ipatlas"));
    cmd.env_remove("MAXMIND_LICENSE_KEY");
    cmd
}

/// Build a fixture database through the CLI and return its path
fn build_fixture(dir: &TempDir) -> std::path::PathBuf {
    let input = dir.path().join("networks.txt");
    fs::write(
        &input,
        "# test networks\n\
         192.0.2.0/24,country=US,asn=64496\n\
         198.51.100.0/24,country=DE\n\
         \n\
         2001:db8::/32,country=NL,anycast=true\n",
    )
    .unwrap();
    let output = dir.path().join("fixture.mmdb");

    ipatlas_cmd()
        .arg("build")
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .arg("-t")
        .arg("Test-Country")
        .arg("-d")
        .arg("CLI fixture")
        .assert()
        .success()
        .stderr(predicate::str::contains("Wrote 3 networks"));
    output
}

#[test]
fn test_help() {
    ipatlas_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("MaxMind DB"));
}

#[test]
fn test_version() {
    ipatlas_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("ipatlas"));
}

#[test]
fn test_subcommand_help() {
    for (command, text) in [
        ("lookup", "Look up an IP address"),
        ("inspect", "Show database metadata"),
        ("analyze", "structural flaws"),
        ("build", "Build an MMDB file"),
        ("watch", "print loader events"),
    ] {
        ipatlas_cmd()
            .arg(command)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains(text));
    }
}

#[test]
fn test_lookup_found() {
    let dir = TempDir::new().unwrap();
    let db = build_fixture(&dir);

    let output = ipatlas_cmd()
        .arg("lookup")
        .arg(&db)
        .arg("192.0.2.77")
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json[0]["country"], "US");
    assert_eq!(json[0]["asn"], 64496);
    assert_eq!(json[0]["cidr"], "192.0.2.0/24");
    assert_eq!(json[0]["prefix_len"], 24);
}

#[test]
fn test_lookup_ipv6_and_mapped() {
    let dir = TempDir::new().unwrap();
    let db = build_fixture(&dir);

    ipatlas_cmd()
        .arg("lookup")
        .arg(&db)
        .arg("2001:db8:ffff::1")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"NL\""))
        .stdout(predicate::str::contains("2001:db8::/32"));

    ipatlas_cmd()
        .arg("lookup")
        .arg(&db)
        .arg("::ffff:198.51.100.1")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"DE\""));
}

#[test]
fn test_lookup_not_found_exits_1() {
    let dir = TempDir::new().unwrap();
    let db = build_fixture(&dir);

    ipatlas_cmd()
        .arg("lookup")
        .arg(&db)
        .arg("192.0.3.5")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("[]"));

    ipatlas_cmd()
        .arg("lookup")
        .arg("--quiet")
        .arg(&db)
        .arg("192.0.3.5")
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_lookup_invalid_address() {
    let dir = TempDir::new().unwrap();
    let db = build_fixture(&dir);

    ipatlas_cmd()
        .arg("lookup")
        .arg(&db)
        .arg("not-an-ip")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not an IP address"));
}

#[test]
fn test_lookup_relative_path() {
    let dir = TempDir::new().unwrap();
    build_fixture(&dir);

    ipatlas_cmd()
        .current_dir(dir.path())
        .arg("lookup")
        .arg("fixture.mmdb")
        .arg("198.51.100.1")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"DE\""));
}

#[test]
fn test_inspect() {
    let dir = TempDir::new().unwrap();
    let db = build_fixture(&dir);

    ipatlas_cmd()
        .arg("inspect")
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("Test-Country"))
        .stdout(predicate::str::contains("CLI fixture"))
        .stdout(predicate::str::contains("IPv6"));

    let output = ipatlas_cmd()
        .arg("inspect")
        .arg("--json")
        .arg(&db)
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["metadata"]["database_type"], "Test-Country");
    assert_eq!(json["metadata"]["ip_version"], 6);
    assert_eq!(json["metadata"]["record_size"], 24);
    assert_eq!(json["source"]["kind"], "filesystem");
}

#[test]
fn test_analyze_clean() {
    let dir = TempDir::new().unwrap();
    let db = build_fixture(&dir);

    ipatlas_cmd()
        .arg("analyze")
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("No flaws found"));
}

#[test]
fn test_analyze_corrupted_exits_1() {
    let dir = TempDir::new().unwrap();
    let db = build_fixture(&dir);

    // Break the first record of the root node
    let mut bytes = fs::read(&db).unwrap();
    bytes[0] = 0xFF;
    fs::write(&db, bytes).unwrap();

    let output = ipatlas_cmd()
        .arg("analyze")
        .arg("--json")
        .arg(&db)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["is_valid"], false);
    assert!(!json["flaws"].as_array().unwrap().is_empty());
}

#[test]
fn test_garbage_database_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("garbage.mmdb");
    fs::write(&path, b"this is not a database").unwrap();

    ipatlas_cmd()
        .arg("lookup")
        .arg("--timeout")
        .arg("5")
        .arg(&path)
        .arg("192.0.2.1")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load database"));
}

#[test]
fn test_invalid_origin() {
    ipatlas_cmd()
        .arg("inspect")
        .arg("ftp://example.com/db.mmdb")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid database"));
}

#[test]
fn test_edition_requires_license_key() {
    ipatlas_cmd()
        .arg("inspect")
        .arg("GeoLite2-City")
        .assert()
        .failure()
        .stderr(predicate::str::contains("license key"));
}

#[test]
fn test_build_rejects_bad_lines() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("bad.txt");
    fs::write(&input, "192.0.2.0/24,oops\n").unwrap();

    ipatlas_cmd()
        .arg("build")
        .arg(&input)
        .arg("-o")
        .arg(dir.path().join("out.mmdb"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Line 1"));

    fs::write(&input, "999.0.2.0/24,a=b\n").unwrap();
    ipatlas_cmd()
        .arg("build")
        .arg(&input)
        .arg("-o")
        .arg(dir.path().join("out.mmdb"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid network"));
}

#[test]
fn test_build_record_sizes() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("networks.txt");
    fs::write(&input, "192.0.2.0/24,country=US\n").unwrap();

    for bits in ["28", "32"] {
        let output = dir.path().join(format!("db{}.mmdb", bits));
        ipatlas_cmd()
            .arg("build")
            .arg(&input)
            .arg("-o")
            .arg(&output)
            .arg("--record-size")
            .arg(bits)
            .assert()
            .success();
        ipatlas_cmd()
            .arg("lookup")
            .arg(&output)
            .arg("192.0.2.1")
            .assert()
            .success()
            .stdout(predicate::str::contains("\"US\""));
    }

    ipatlas_cmd()
        .arg("build")
        .arg(&input)
        .arg("-o")
        .arg(dir.path().join("bad.mmdb"))
        .arg("--record-size")
        .arg("20")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unsupported record size"));
}
